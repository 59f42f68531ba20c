//! Process inspection and signalling helpers.
//!
//! All checks go through portable `kill`/`ps` invocations so behaviour is
//! identical on Linux and macOS hosts.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::time::Duration;

/// One row of the system process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
}

/// Returns true if the process with `pid` is currently running.
///
/// Sends signal 0 via `kill -0`: checks existence without delivering an
/// actual signal; works on all Unix systems.
pub fn is_pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Send SIGTERM so the process can shut down cleanly.
pub fn send_term(pid: u32) {
    let _ = Command::new("kill").arg(pid.to_string()).status();
}

/// Send SIGKILL.
pub fn send_kill(pid: u32) {
    let _ = Command::new("kill").args(["-9", &pid.to_string()]).status();
}

/// Snapshot the process table (`pid`, `ppid`, command line).
pub fn list_processes() -> Vec<ProcEntry> {
    let out = Command::new("ps")
        .args(["-eo", "pid=,ppid=,command="])
        .stderr(Stdio::null())
        .output();
    match out {
        Ok(o) => parse_ps_table(&String::from_utf8_lossy(&o.stdout)),
        Err(_) => Vec::new(),
    }
}

/// Parse `ps -eo pid=,ppid=,command=` output. Malformed lines are skipped.
pub fn parse_ps_table(output: &str) -> Vec<ProcEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, char::is_whitespace);
            let pid: u32 = parts.next()?.trim().parse().ok()?;
            let ppid: u32 = parts.next()?.trim().parse().ok()?;
            let command = parts.next().unwrap_or("").trim().to_string();
            Some(ProcEntry { pid, ppid, command })
        })
        .collect()
}

/// All descendants of `root` (children, grandchildren, …), found by walking
/// the parent-PID chain of a process-table snapshot.
pub fn descendants_in(table: &[ProcEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry.pid);
    }
    let mut found = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                // Guard against pathological snapshots with pid cycles.
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    found
}

/// Live descendants of `root` from a fresh process-table snapshot.
pub fn descendants(root: u32) -> Vec<u32> {
    descendants_in(&list_processes(), root)
}

/// Ancestor chain of `pid` (parent, grandparent, …) up to init.
pub fn ancestors_in(table: &[ProcEntry], pid: u32) -> Vec<u32> {
    let parents: HashMap<u32, u32> = table.iter().map(|e| (e.pid, e.ppid)).collect();
    let mut chain = Vec::new();
    let mut cur = pid;
    while let Some(&parent) = parents.get(&cur) {
        if parent == 0 || chain.contains(&parent) {
            break;
        }
        chain.push(parent);
        cur = parent;
    }
    chain
}

/// TERM the whole process tree rooted at `pid` (deepest first), wait a
/// 1-second grace, then KILL whatever survived. Prevents MCP servers and
/// child tool processes from outliving their worker.
pub fn kill_tree(pid: u32) {
    let mut targets = descendants(pid);
    targets.push(pid);
    for &t in &targets {
        send_term(t);
    }
    std::thread::sleep(Duration::from_secs(1));
    for &t in &targets {
        if is_pid_alive(t) {
            send_kill(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<ProcEntry> {
        parse_ps_table(
            "    1     0 /sbin/init\n\
             100     1 worker --task t1\n\
             101   100 node mcp-server\n\
             102   101 rg pattern\n\
             200     1 unrelated\n",
        )
    }

    #[test]
    fn parses_ps_rows() {
        let t = table();
        assert_eq!(t.len(), 5);
        assert_eq!(t[1].pid, 100);
        assert_eq!(t[1].ppid, 1);
        assert_eq!(t[1].command, "worker --task t1");
    }

    #[test]
    fn skips_malformed_lines() {
        let t = parse_ps_table("garbage\n100 1 ok\nalso garbage here\n");
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].pid, 100);
    }

    #[test]
    fn descendants_walks_full_chain() {
        let mut kids = descendants_in(&table(), 100);
        kids.sort();
        assert_eq!(kids, [101, 102]);
    }

    #[test]
    fn descendants_of_leaf_is_empty() {
        assert!(descendants_in(&table(), 102).is_empty());
    }

    #[test]
    fn ancestors_walks_to_init() {
        assert_eq!(ancestors_in(&table(), 102), [101, 100, 1]);
    }

    #[test]
    fn self_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // PIDs max out well below this on any real system.
        assert!(!is_pid_alive(4_000_000));
    }
}
