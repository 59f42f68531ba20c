//! Worker PID files, keyed by task id under `<data dir>/pids/`.
//!
//! Single-writer per task (the dispatching pulse); everything else only
//! reads. The hygiene sweep removes files whose process is dead.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::proc::is_pid_alive;

pub fn pid_path(pids_dir: &Path, task_id: &str) -> PathBuf {
    pids_dir.join(format!("{task_id}.pid"))
}

/// Record the worker PID for a task.
pub fn write_pid(pids_dir: &Path, task_id: &str, pid: u32) -> Result<()> {
    fs::create_dir_all(pids_dir)?;
    fs::write(pid_path(pids_dir, task_id), format!("{pid}\n"))
        .with_context(|| format!("writing pid file for {task_id}"))?;
    Ok(())
}

/// Read the recorded PID, if the file exists and parses.
pub fn read_pid(pids_dir: &Path, task_id: &str) -> Option<u32> {
    fs::read_to_string(pid_path(pids_dir, task_id))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid(pids_dir: &Path, task_id: &str) {
    let _ = fs::remove_file(pid_path(pids_dir, task_id));
}

/// Is the recorded worker for this task alive?
pub fn worker_alive(pids_dir: &Path, task_id: &str) -> bool {
    read_pid(pids_dir, task_id).is_some_and(is_pid_alive)
}

/// All `(task_id, pid)` pairs currently on disk.
pub fn list_pids(pids_dir: &Path) -> Vec<(String, u32)> {
    let Ok(entries) = fs::read_dir(pids_dir) else {
        return Vec::new();
    };
    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "pid") {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(pid) = fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                pids.push((stem.to_string(), pid));
            }
        }
    }
    pids.sort();
    pids
}
