//! Listener enumeration for diagnostics.
//!
//! Answers "who is holding this port" on a best-effort basis. Every failure
//! (tool missing, permission denied, unparsable output) yields an empty list.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Find every process listening on `port`, excluding this process.
pub fn find_owning_processes(port: u16) -> Vec<ProcessInfo> {
    let own_pid = std::process::id();
    let mut found = platform_lookup(port);
    found.retain(|p| p.pid != own_pid);
    found
}

#[cfg(target_os = "linux")]
fn platform_lookup(port: u16) -> Vec<ProcessInfo> {
    // ss is usually present; lsof catches sockets ss cannot attribute
    let mut processes = run_tool("ss", &["-tlnp", &format!("sport = :{}", port)])
        .map(|out| parse_ss(&out))
        .unwrap_or_default();
    let seen: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
    processes.extend(
        lsof(port)
            .into_iter()
            .filter(|p| !seen.contains(&p.pid)),
    );
    processes
}

#[cfg(all(unix, not(target_os = "linux")))]
fn platform_lookup(port: u16) -> Vec<ProcessInfo> {
    lsof(port)
}

#[cfg(windows)]
fn platform_lookup(port: u16) -> Vec<ProcessInfo> {
    run_tool("netstat", &["-ano", "-p", "TCP"])
        .map(|out| parse_netstat(&out, port))
        .unwrap_or_default()
}

#[cfg(not(any(unix, windows)))]
fn platform_lookup(_port: u16) -> Vec<ProcessInfo> {
    Vec::new()
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(unix)]
fn lsof(port: u16) -> Vec<ProcessInfo> {
    run_tool(
        "lsof",
        &["-i", &format!("TCP:{}", port), "-sTCP:LISTEN", "-P", "-n", "-F", "pcn"],
    )
    .map(|out| parse_lsof_fields(&out))
    .unwrap_or_default()
}

/// Parse `lsof -F pcn` output. Each process block starts with a `p` line
/// followed by its `c` (command) line.
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn parse_lsof_fields(stdout: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    let mut seen = HashSet::new();
    let mut current: Option<ProcessInfo> = None;

    let mut flush = |entry: Option<ProcessInfo>, out: &mut Vec<ProcessInfo>| {
        if let Some(info) = entry {
            if seen.insert(info.pid) {
                out.push(info);
            }
        }
    };

    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            flush(current.take(), &mut processes);
            current = pid.parse::<u32>().ok().map(|pid| ProcessInfo {
                pid,
                name: "unknown".to_string(),
                command: None,
            });
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(info) = current.as_mut() {
                info.name = command.to_string();
                info.command = Some(command.to_string());
            }
        }
    }
    flush(current.take(), &mut processes);

    processes
}

/// Parse `ss -tlnp` output, reading names from /proc when available.
#[cfg(target_os = "linux")]
pub(crate) fn parse_ss(stdout: &str) -> Vec<ProcessInfo> {
    let mut processes = Vec::new();
    let mut seen = HashSet::new();

    // Skip header. The users column looks like users:(("node",pid=123,fd=20))
    for line in stdout.lines().skip(1) {
        for part in line.split(|c| c == ',' || c == ')' || c == '(') {
            let Some(pid) = part.strip_prefix("pid=").and_then(|p| p.parse::<u32>().ok()) else {
                continue;
            };
            if !seen.insert(pid) {
                continue;
            }
            let name = std::fs::read_to_string(format!("/proc/{}/comm", pid))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let command = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
                .ok()
                .map(|s| s.replace('\0', " ").trim().to_string())
                .filter(|s| !s.is_empty());
            processes.push(ProcessInfo { pid, name, command });
        }
    }

    processes
}

/// Parse `netstat -ano` output for LISTENING sockets on `port`.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_netstat(stdout: &str, port: u16) -> Vec<ProcessInfo> {
    let suffix = format!(":{}", port);
    let mut seen = HashSet::new();
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local Address  Foreign Address  State  PID
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            let pid = cols[4].parse::<u32>().ok()?;
            seen.insert(pid).then(|| ProcessInfo {
                pid,
                name: "unknown".to_string(),
                command: None,
            })
        })
        .collect()
}
