use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};

/// Put the child in its own process group so the whole tree can be signalled.
pub fn configure(cmd: &mut tokio::process::Command) {
    cmd.process_group(0);
}

/// Liveness via `kill(pid, 0)`. EPERM means the process exists but belongs to
/// someone else.
pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = validate_pid_for_check(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Zombie check through /proc on Linux. Elsewhere a zombie is reported alive
/// until its parent reaps it.
pub fn is_zombie(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                // Field 3 follows the parenthesised comm, which may itself contain spaces
                let after = stat.rsplit_once(')')?.1;
                after.split_whitespace().next().map(|state| state == "Z")
            })
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}

/// Signal the process group of `pid`, falling back to the single process.
pub fn signal_tree(pid: u32, force: bool, service: &str) -> Result<()> {
    let pid = Pid::from_raw(validate_pid(pid, service)? as i32);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };

    let group = getpgid(Some(pid)).ok().filter(|pgid| pgid.as_raw() > 1);
    let result = match group {
        Some(pgid) => killpg(pgid, signal).or_else(|_| kill(pid, signal)),
        None => kill(pid, signal),
    };

    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Process(format!(
            "failed to send {} to pid {} ({}): {}",
            signal, pid, service, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
    }

    #[test]
    fn signalling_init_is_refused() {
        assert!(signal_tree(1, true, "svc").is_err());
    }
}
