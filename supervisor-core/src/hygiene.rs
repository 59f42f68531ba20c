//! Process and workspace hygiene.
//!
//! Three jobs: reap dead PID files, kill worker descendants of tasks that
//! reached a terminal state, and the explicit `kill-workers` orphan sweep
//! guarded by an active-PID protection set.

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

use crate::config::Config;
use crate::proc::{self, ProcEntry};
use crate::store::{Store, TaskFilter};
use crate::task::TaskState;
use crate::{gitops, pidfile};

/// Per-pulse hygiene sweep. Returns human-readable notes of what was done.
pub fn sweep(store: &Store, cfg: &Config) -> Result<Vec<String>> {
    let mut notes = Vec::new();
    let pids_dir = cfg.pids_dir();

    for (task_id, pid) in pidfile::list_pids(&pids_dir) {
        let task = store.find_task(&task_id)?;
        let alive = proc::is_pid_alive(pid);
        let terminal = task
            .as_ref()
            .map(|t| t.status.is_terminal_for_batch())
            .unwrap_or(true);

        if terminal && alive {
            // Cancelled/finished task with a surviving tree: bring it down.
            proc::kill_tree(pid);
            pidfile::remove_pid(&pids_dir, &task_id);
            notes.push(format!("{task_id}: killed worker tree (pid {pid}) for terminal task"));
        } else if terminal && !alive {
            pidfile::remove_pid(&pids_dir, &task_id);
            notes.push(format!("{task_id}: removed stale pid file"));
        } else if !alive {
            // Task still looks active but its worker is gone; the next
            // worker-check sweep will evaluate it.
            pidfile::remove_pid(&pids_dir, &task_id);
            notes.push(format!(
                "{task_id}: worker pid {pid} dead while task active — pid file removed"
            ));
        }
    }
    Ok(notes)
}

/// `cleanup` verb: remove worktrees and PID files of terminal tasks.
pub fn cleanup(store: &Store, cfg: &Config, dry_run: bool) -> Result<Vec<String>> {
    let mut notes = Vec::new();
    let terminal: Vec<TaskState> = crate::task::ALL_STATES
        .into_iter()
        .filter(|s| s.is_terminal_for_batch())
        .collect();
    for task in store.list_tasks(&TaskFilter::by_status(&terminal))? {
        if let Some(wt) = task.worktree.as_deref() {
            notes.push(format!("{}: remove worktree {wt}", task.id));
            if !dry_run {
                gitops::remove_worktree(Path::new(&task.repo), Path::new(wt));
                let mut cleared = task.clone();
                cleared.worktree = None;
                cleared.branch = None;
                store.save_task(&cleared)?;
            }
        }
        if pidfile::read_pid(&cfg.pids_dir(), &task.id).is_some() {
            notes.push(format!("{}: remove pid file", task.id));
            if !dry_run {
                pidfile::remove_pid(&cfg.pids_dir(), &task.id);
            }
        }
    }
    Ok(notes)
}

/// PIDs that must never be touched by the emergency sweep: all active
/// workers, their whole descendant trees, and the invoking shell's
/// ancestor chain.
pub fn protection_set(table: &[ProcEntry], active_worker_pids: &[u32], self_pid: u32) -> HashSet<u32> {
    let mut protected: HashSet<u32> = HashSet::new();
    for &pid in active_worker_pids {
        protected.insert(pid);
        protected.extend(proc::descendants_in(table, pid));
    }
    protected.insert(self_pid);
    protected.extend(proc::ancestors_in(table, self_pid));
    protected
}

/// Orphaned worker processes: re-parented to init (PPID 1), command matches
/// the worker CLI, and not protected.
pub fn find_orphans(table: &[ProcEntry], worker_cli: &str, protected: &HashSet<u32>) -> Vec<u32> {
    table
        .iter()
        .filter(|e| e.ppid == 1)
        .filter(|e| e.command.contains(worker_cli))
        .filter(|e| !protected.contains(&e.pid))
        .map(|e| e.pid)
        .collect()
}

/// `kill-workers` verb: TERM then KILL every orphaned worker process.
pub fn emergency_kill(store: &Store, cfg: &Config, dry_run: bool) -> Result<Vec<u32>> {
    let table = proc::list_processes();
    let active: Vec<u32> = store
        .list_tasks(&TaskFilter::by_status(&[TaskState::Dispatched, TaskState::Running]))?
        .iter()
        .filter_map(|t| t.worker_pid())
        .collect();
    let protected = protection_set(&table, &active, std::process::id());
    let orphans = find_orphans(&table, &cfg.worker_cli, &protected);

    if !dry_run {
        for &pid in &orphans {
            proc::kill_tree(pid);
        }
    }
    Ok(orphans)
}
