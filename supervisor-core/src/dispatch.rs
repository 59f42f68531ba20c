//! Dispatcher: takes a task from `queued` to `running`.
//!
//! Order matters and is load-bearing:
//!   gate → concurrency budget → health probe → worktree → transition to
//!   dispatched (with workspace fields) → memory preamble → detached launch
//!   → PID file → transition to running.
//!
//! A task is never dispatched twice concurrently because the
//! queued→dispatched move is validated inside a single store transaction.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::health::HealthProbe;
use crate::machine::{self, Fields};
use crate::store::Store;
use crate::task::{Batch, Task, TaskState};
use crate::{gitops, loadctl, memory, pidfile, spawn, sysinfo};

/// Result of one dispatch attempt. Only `Failed` consumed a retry; the
/// others leave the task queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { pid: u32 },
    /// Budget exhausted — not an error, the pulse moves to the next task.
    ConcurrencyLimited,
    /// Health probe failed — the pulse stops dispatching entirely.
    ProviderUnavailable,
    /// Task is not in a dispatchable state.
    NotDispatchable(String),
    /// Worktree or launch failure; the task was moved to `failed`.
    Failed(String),
    /// Reprompt found the retry budget spent; task was moved to `blocked`.
    BlockedMaxRetries,
}

/// Pure dispatch gate: why can this task not be dispatched right now?
pub fn gate_reason(task: &Task) -> Option<String> {
    if task.status != TaskState::Queued {
        return Some(format!("status is {}, not queued", task.status));
    }
    if task.retries >= task.max_retries {
        return Some(format!(
            "retries exhausted ({}/{})",
            task.retries, task.max_retries
        ));
    }
    None
}

/// Effective budget for this dispatch attempt: the batch's base budget (or
/// the global cap when batchless) shaped by the live load sample.
pub fn effective_budget(batch: Option<&Batch>, cfg: &Config) -> u32 {
    let sample = sysinfo::sample();
    let (base, factor) = match batch {
        Some(b) => (b.concurrency, b.max_load_factor),
        None => (cfg.max_concurrency, 2),
    };
    loadctl::effective_concurrency(base, factor, &sample)
}

pub struct Dispatcher<'a> {
    pub store: &'a Store,
    pub cfg: &'a Config,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a Store, cfg: &'a Config) -> Self {
        Self { store, cfg }
    }

    /// Dispatch one queued task, honouring batch and global budgets.
    pub fn dispatch(
        &self,
        task_id: &str,
        batch: Option<&Batch>,
        health: &mut HealthProbe,
    ) -> Result<DispatchOutcome> {
        // 1. Re-read: state may have moved since the caller listed tasks.
        let Some(task) = self.store.find_task(task_id)? else {
            return Ok(DispatchOutcome::NotDispatchable(format!(
                "unknown task {task_id}"
            )));
        };
        if let Some(reason) = gate_reason(&task) {
            return Ok(DispatchOutcome::NotDispatchable(reason));
        }

        // 2. Budget check — consulted per attempt so a long dispatch loop
        //    throttles mid-flight.
        let budget = effective_budget(batch, self.cfg);
        let active = self.store.active_count(batch.map(|b| b.id))?;
        if active >= budget || self.store.active_count(None)? >= self.cfg.max_concurrency {
            return Ok(DispatchOutcome::ConcurrencyLimited);
        }

        // 3. Provider health.
        if !health.probe(&self.cfg.worker_cli, &task.model) {
            return Ok(DispatchOutcome::ProviderUnavailable);
        }

        // 4. Worktree. Failure never reached `dispatched`, so the move to
        //    `failed` goes through the audited force path.
        let repo = Path::new(&task.repo);
        let worktree = match gitops::ensure_worktree(repo, &task.id) {
            Ok(wt) => wt,
            Err(e) => {
                let reason = format!("worktree: {e}");
                machine::force_transition(
                    self.store,
                    &task.id,
                    TaskState::Failed,
                    &reason,
                    Fields::error(&reason),
                )?;
                return Ok(DispatchOutcome::Failed(reason));
            }
        };

        // 5–6. Log path, then the guarded queued→dispatched move.
        let log_file = self.new_log_path(&task.id)?;
        machine::transition(
            self.store,
            &task.id,
            TaskState::Dispatched,
            "dispatch",
            Fields {
                worktree: Some(worktree.display().to_string()),
                branch: Some(task.feature_branch()),
                log_file: Some(log_file.display().to_string()),
                ..Fields::default()
            },
        )?;

        // 7–8. Prompt with memory preamble.
        let preamble = memory::recall(&self.cfg.memory_dir(), &task.repo);
        let prompt = build_worker_prompt(&task, &preamble);

        self.launch(&task.id, &task.model, &prompt, &worktree, &log_file)
    }

    /// Reprompt path: relaunch a `retrying` task inside its existing
    /// worktree, preserving partial work. At the retry ceiling the task is
    /// blocked instead (the caller triggers the self-healer).
    pub fn reprompt(
        &self,
        task_id: &str,
        extra_context: Option<&str>,
        health: &mut HealthProbe,
    ) -> Result<DispatchOutcome> {
        let Some(task) = self.store.find_task(task_id)? else {
            return Ok(DispatchOutcome::NotDispatchable(format!(
                "unknown task {task_id}"
            )));
        };
        if task.status != TaskState::Retrying {
            return Ok(DispatchOutcome::NotDispatchable(format!(
                "status is {}, not retrying",
                task.status
            )));
        }
        if task.retries >= task.max_retries {
            machine::transition(
                self.store,
                &task.id,
                TaskState::Failed,
                "max retries exhausted",
                Fields::error("blocked:max_retries"),
            )
            .ok();
            // retrying → failed is the legal route; record the block reason
            // on the task and let the healer take it from `failed`.
            return Ok(DispatchOutcome::BlockedMaxRetries);
        }

        if !health.probe(&self.cfg.worker_cli, &task.model) {
            return Ok(DispatchOutcome::ProviderUnavailable);
        }

        let repo = Path::new(&task.repo);
        let worktree = match task.worktree.as_deref().map(Path::new) {
            Some(wt) if wt.exists() => wt.to_path_buf(),
            _ => match gitops::ensure_worktree(repo, &task.id) {
                Ok(wt) => wt,
                Err(e) => {
                    let reason = format!("worktree: {e}");
                    machine::transition(
                        self.store,
                        &task.id,
                        TaskState::Failed,
                        &reason,
                        Fields::error(&reason),
                    )?;
                    return Ok(DispatchOutcome::Failed(reason));
                }
            },
        };

        let log_file = self.new_log_path(&task.id)?;
        machine::transition(
            self.store,
            &task.id,
            TaskState::Dispatched,
            &format!("reprompt (retry {}/{})", task.retries, task.max_retries),
            Fields {
                worktree: Some(worktree.display().to_string()),
                log_file: Some(log_file.display().to_string()),
                ..Fields::default()
            },
        )?;

        let prompt = build_reprompt(&task, extra_context);
        self.launch(&task.id, &task.model, &prompt, &worktree, &log_file)
    }

    /// Launch a "fix" worker on the same branch for review feedback
    /// (review_triage → dispatched).
    pub fn dispatch_fix(&self, task_id: &str, feedback: &str) -> Result<DispatchOutcome> {
        let Some(task) = self.store.find_task(task_id)? else {
            return Ok(DispatchOutcome::NotDispatchable(format!(
                "unknown task {task_id}"
            )));
        };
        let repo = Path::new(&task.repo);
        let worktree = match task.worktree.as_deref().map(Path::new) {
            Some(wt) if wt.exists() => wt.to_path_buf(),
            _ => match gitops::ensure_worktree(repo, &task.id) {
                Ok(wt) => wt,
                Err(e) => {
                    return Ok(DispatchOutcome::Failed(format!("worktree: {e}")));
                }
            },
        };
        let log_file = self.new_log_path(&task.id)?;
        machine::transition(
            self.store,
            &task.id,
            TaskState::Dispatched,
            "review feedback fix",
            Fields {
                worktree: Some(worktree.display().to_string()),
                log_file: Some(log_file.display().to_string()),
                ..Fields::default()
            },
        )?;
        let prompt = build_fix_prompt(&task, feedback);
        self.launch(&task.id, &task.model, &prompt, &worktree, &log_file)
    }

    // ── Internal ──────────────────────────────────────────────────────────────

    fn new_log_path(&self, task_id: &str) -> Result<std::path::PathBuf> {
        let logs = self.cfg.logs_dir();
        std::fs::create_dir_all(&logs)?;
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        Ok(logs.join(format!("{task_id}-{stamp}.log")))
    }

    fn launch(
        &self,
        task_id: &str,
        model: &str,
        prompt: &str,
        worktree: &Path,
        log_file: &Path,
    ) -> Result<DispatchOutcome> {
        if self.cfg.dispatch_mode == crate::config::DispatchMode::Tabby {
            // Tab-hosted workers need a terminal multiplexer session; from
            // cron there is none, so degrade rather than lose the dispatch.
            eprintln!("[{task_id}] tabby dispatch unavailable here, launching headless");
        }
        let args = vec![
            "--model".to_string(),
            model.to_string(),
            "-p".to_string(),
            prompt.to_string(),
        ];
        match spawn::spawn_detached(&self.cfg.worker_cli, &args, &[], worktree, log_file) {
            Ok(pid) => {
                pidfile::write_pid(&self.cfg.pids_dir(), task_id, pid)?;
                machine::transition(
                    self.store,
                    task_id,
                    TaskState::Running,
                    "worker launched",
                    Fields {
                        session_id: Some(format!("pid:{pid}")),
                        ..Fields::default()
                    },
                )?;
                Ok(DispatchOutcome::Dispatched { pid })
            }
            Err(e) => {
                let reason = format!("launch: {e}");
                machine::transition(
                    self.store,
                    task_id,
                    TaskState::Failed,
                    &reason,
                    Fields::error(&reason),
                )?;
                Ok(DispatchOutcome::Failed(reason))
            }
        }
    }
}

// ── Prompt builders ───────────────────────────────────────────────────────────

fn build_worker_prompt(task: &Task, memory_preamble: &str) -> String {
    format!(
        "{memory_preamble}You are working in an isolated git worktree on branch {branch}.\n\n\
         Your task ({id}):\n{description}\n\n\
         Instructions:\n\
         - Stay on branch {branch} — do NOT create another branch\n\
         - Implement the change, run the repo's tests, and commit your work\n\
         - Push the branch and open a pull request against the default branch\n\
         - When the PR is open, print FULL_LOOP_COMPLETE and the PR URL on their own lines\n\
         - If the work is done but no PR is warranted, print TASK_COMPLETE instead\n",
        branch = task.feature_branch(),
        id = task.id,
        description = task.description,
    )
}

fn build_reprompt(task: &Task, extra_context: Option<&str>) -> String {
    let previous_error = task.error.as_deref().unwrap_or("unknown");
    let extra = extra_context
        .map(|c| format!("\nAdditional context:\n{c}\n"))
        .unwrap_or_default();
    format!(
        "You are resuming interrupted work in an existing git worktree on branch {branch}.\n\
         Partial work may already be present — inspect `git status` and `git log` first.\n\n\
         Original task ({id}):\n{description}\n\n\
         The previous attempt ended with: {previous_error}\n{extra}\n\
         Instructions:\n\
         - Keep existing commits; continue rather than restart\n\
         - Finish the task, commit, push, and open a pull request\n\
         - Print FULL_LOOP_COMPLETE and the PR URL when the PR is open\n",
        branch = task.feature_branch(),
        id = task.id,
        description = task.description,
    )
}

fn build_fix_prompt(task: &Task, feedback: &str) -> String {
    format!(
        "You are addressing review feedback on an open pull request.\n\
         The worktree is on branch {branch}, which the PR tracks.\n\n\
         Original task ({id}):\n{description}\n\n\
         Unresolved review feedback:\n{feedback}\n\n\
         Instructions:\n\
         - Make targeted changes that address every point — no rewrites\n\
         - Commit with messages referencing the feedback; never amend or force-push\n\
         - Push to the same branch and print TASK_COMPLETE when done\n",
        branch = task.feature_branch(),
        id = task.id,
        description = task.description,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::utc_now;

    fn task(status: TaskState, retries: u32) -> Task {
        Task {
            id: "t101".to_string(),
            repo: "/repos/demo".to_string(),
            description: "implement foo".to_string(),
            status,
            model: "coding".to_string(),
            retries,
            max_retries: 3,
            session_id: None,
            worktree: None,
            branch: None,
            log_file: None,
            error: Some("retry:rate_limited".to_string()),
            pr_url: None,
            created_at: utc_now(),
            started_at: None,
            completed_at: None,
            updated_at: utc_now(),
        }
    }

    #[test]
    fn gate_requires_queued() {
        assert!(gate_reason(&task(TaskState::Queued, 0)).is_none());
        let reason = gate_reason(&task(TaskState::Running, 0)).unwrap();
        assert!(reason.contains("running"));
    }

    #[test]
    fn gate_requires_retry_budget() {
        let reason = gate_reason(&task(TaskState::Queued, 3)).unwrap();
        assert!(reason.contains("retries exhausted"));
    }

    #[test]
    fn worker_prompt_names_branch_and_markers() {
        let p = build_worker_prompt(&task(TaskState::Queued, 0), "");
        assert!(p.contains("feature/t101"));
        assert!(p.contains("FULL_LOOP_COMPLETE"));
        assert!(p.contains("implement foo"));
        assert!(p.starts_with("You are working"));
    }

    #[test]
    fn worker_prompt_carries_memory_preamble() {
        let p = build_worker_prompt(&task(TaskState::Queued, 0), "Lessons: avoid sudo.\n");
        assert!(p.starts_with("Lessons: avoid sudo."));
    }

    #[test]
    fn reprompt_includes_previous_error() {
        let p = build_reprompt(&task(TaskState::Retrying, 1), Some("log tail here"));
        assert!(p.contains("retry:rate_limited"));
        assert!(p.contains("log tail here"));
        assert!(p.contains("inspect `git status`"));
    }

    #[test]
    fn fix_prompt_forbids_force_push() {
        let p = build_fix_prompt(&task(TaskState::ReviewTriage, 0), "- rename the helper");
        assert!(p.contains("rename the helper"));
        assert!(p.contains("never amend or force-push"));
    }
}
