use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use std::process::Command;

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// New process group so console control events reach only this tree.
pub fn configure(cmd: &mut tokio::process::Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = validate_pid_for_check(pid) else {
        return false;
    };
    let filter = format!("PID eq {}", pid);
    Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)))
        .unwrap_or(false)
}

pub fn is_zombie(_pid: u32) -> bool {
    false
}

/// `taskkill /T` walks the child tree; `/F` makes it forceful.
pub fn signal_tree(pid: u32, force: bool, service: &str) -> Result<()> {
    let pid = validate_pid(pid, service)?;
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }

    let output = Command::new("taskkill")
        .args(&args)
        .output()
        .map_err(|e| Error::Process(format!("failed to run taskkill: {}", e)))?;

    if output.status.success() || !pid_alive(pid) {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(Error::Process(format!(
        "taskkill failed for pid {} ({}): {}",
        pid, service, detail
    )))
}
