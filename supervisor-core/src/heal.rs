//! Self-healing via diagnostic subtasks.
//!
//! When a task lands in `failed` or `blocked` for a recoverable reason, the
//! supervisor synthesises one diagnostic subtask (`<id>-diag-1`) whose
//! worker analyses the original log and repairs the cause. When the
//! diagnostic completes, the parent returns to `queued` with its retry
//! budget restored.
//!
//! Guards: hard blockers are never healed, diagnostics never get their own
//! diagnostics, and the per-parent limit is explicit config.

use anyhow::Result;

use crate::config::Config;
use crate::machine::{self, Fields};
use crate::store::Store;
use crate::task::{Task, TaskState};

/// Failure kinds that always need a human. Never self-healed.
pub const HARD_BLOCKERS: [&str; 3] = ["auth_error", "out_of_memory", "merge_conflict"];

/// Is this failure reason worth a diagnostic worker?
pub fn is_recoverable(reason: &str) -> bool {
    !HARD_BLOCKERS.iter().any(|hb| reason.contains(hb))
}

pub fn diagnostic_id(parent_id: &str, n: u32) -> String {
    format!("{parent_id}-diag-{n}")
}

/// Parent id of a diagnostic (`t101-diag-1` → `t101`).
pub fn parent_of(diag_id: &str) -> Option<&str> {
    let (parent, n) = diag_id.rsplit_once("-diag-")?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(parent)
}

/// Decide whether `task` should get a diagnostic right now.
pub fn should_heal(store: &Store, cfg: &Config, task: &Task) -> Result<bool> {
    if !cfg.self_heal {
        return Ok(false);
    }
    if !matches!(task.status, TaskState::Failed | TaskState::Blocked) {
        return Ok(false);
    }
    // Recursion guard: diagnostics never self-heal.
    if task.is_diagnostic() {
        return Ok(false);
    }
    let reason = task.error.as_deref().unwrap_or("");
    if !is_recoverable(reason) {
        return Ok(false);
    }
    // Explicit limit (default 1): the naming scheme supports -diag-2 but it
    // is never created unless max_diagnostics is raised.
    for n in 1..=cfg.max_diagnostics {
        if store.find_task(&diagnostic_id(&task.id, n))?.is_none() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Create the next diagnostic subtask. Returns its id, or None when the
/// guards say no.
pub fn create_diagnostic(store: &Store, cfg: &Config, task: &Task) -> Result<Option<String>> {
    if !should_heal(store, cfg, task)? {
        return Ok(None);
    }
    let mut next = None;
    for n in 1..=cfg.max_diagnostics {
        let id = diagnostic_id(&task.id, n);
        if store.find_task(&id)?.is_none() {
            next = Some(id);
            break;
        }
    }
    let Some(diag_id) = next else {
        return Ok(None);
    };

    let description = build_diagnostic_description(task);
    store.insert_task(&diag_id, &task.repo, &description, &task.model, task.max_retries)?;
    Ok(Some(diag_id))
}

fn build_diagnostic_description(task: &Task) -> String {
    let log_pointer = task
        .log_file
        .as_deref()
        .map(|l| format!("The failing attempt's log is at {l}; read its tail first.\n"))
        .unwrap_or_default();
    format!(
        "Diagnose and fix the failure of task {id}.\n\n\
         Original task:\n{description}\n\n\
         It ended with: {error}\n{log_pointer}\
         Analyse the root cause, apply the smallest fix that unblocks the \
         original task, and commit your work.",
        id = task.id,
        description = task.description,
        error = task.error.as_deref().unwrap_or("unknown"),
    )
}

/// A diagnostic reached `complete`: requeue its parent with a fresh retry
/// budget. Returns the parent id when a requeue happened.
pub fn on_diagnostic_complete(store: &Store, diag: &Task) -> Result<Option<String>> {
    let Some(parent_id) = parent_of(&diag.id) else {
        return Ok(None);
    };
    let Some(parent) = store.find_task(parent_id)? else {
        return Ok(None);
    };
    if !matches!(parent.status, TaskState::Failed | TaskState::Blocked) {
        return Ok(None);
    }
    machine::transition(
        store,
        parent_id,
        TaskState::Queued,
        &format!("diagnostic {} complete", diag.id),
        Fields::default(),
    )?;
    // Fresh budget for the healed retry run.
    store.with_transaction(|s| {
        let Some(mut p) = s.find_task(parent_id)? else {
            anyhow::bail!("parent {parent_id} vanished during requeue");
        };
        p.retries = 0;
        p.error = None;
        s.save_task(&p)
    })?;
    Ok(Some(parent_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::transition;
    use crate::task::TaskState::*;

    fn cfg() -> Config {
        let dir = std::env::temp_dir();
        Config::load_with_env(|k| {
            (k == "AIDEVOPS_SUPERVISOR_DIR").then(|| dir.display().to_string())
        })
        .unwrap()
    }

    fn failed_task(store: &Store, id: &str, error: &str) -> Task {
        store.insert_task(id, "/repos/demo", "demo work", "coding", 3).unwrap();
        for to in [Dispatched, Running, Evaluating] {
            transition(store, id, to, "test", Fields::default()).unwrap();
        }
        let (task, _) = transition(store, id, Failed, error, Fields::error(error)).unwrap();
        task
    }

    #[test]
    fn recoverable_reasons() {
        assert!(is_recoverable("failed:max_retries"));
        assert!(is_recoverable("retry:timeout"));
        assert!(!is_recoverable("blocked:auth_error"));
        assert!(!is_recoverable("blocked:out_of_memory"));
        assert!(!is_recoverable("blocked:merge_conflict"));
    }

    #[test]
    fn diagnostic_parent_round_trip() {
        assert_eq!(parent_of(&diagnostic_id("t101", 1)), Some("t101"));
        assert_eq!(parent_of("t101"), None);
        assert_eq!(parent_of("t101-diag-x"), None);
    }

    #[test]
    fn creates_one_diagnostic_for_recoverable_failure() {
        let store = Store::open_in_memory().unwrap();
        let task = failed_task(&store, "t1", "failed:max_retries");

        let diag_id = create_diagnostic(&store, &cfg(), &task).unwrap().unwrap();
        assert_eq!(diag_id, "t1-diag-1");

        let diag = store.find_task("t1-diag-1").unwrap().unwrap();
        assert_eq!(diag.status, Queued);
        assert!(diag.description.contains("failure of task t1"));
        assert!(diag.description.contains("failed:max_retries"));

        // Second request hits the default limit of 1.
        assert!(create_diagnostic(&store, &cfg(), &task).unwrap().is_none());
    }

    #[test]
    fn hard_blockers_are_never_healed() {
        let store = Store::open_in_memory().unwrap();
        let task = failed_task(&store, "t1", "blocked:auth_error");
        assert!(create_diagnostic(&store, &cfg(), &task).unwrap().is_none());
    }

    #[test]
    fn diagnostics_do_not_recurse() {
        let store = Store::open_in_memory().unwrap();
        let diag = failed_task(&store, "t1-diag-1", "failed:max_retries");
        assert!(create_diagnostic(&store, &cfg(), &diag).unwrap().is_none());
    }

    #[test]
    fn disabled_by_config() {
        let store = Store::open_in_memory().unwrap();
        let task = failed_task(&store, "t1", "failed:max_retries");
        let mut cfg = cfg();
        cfg.self_heal = false;
        assert!(create_diagnostic(&store, &cfg, &task).unwrap().is_none());
    }

    #[test]
    fn raised_limit_allows_second_diagnostic() {
        let store = Store::open_in_memory().unwrap();
        let task = failed_task(&store, "t1", "failed:max_retries");
        let mut cfg = cfg();
        cfg.max_diagnostics = 2;

        assert_eq!(
            create_diagnostic(&store, &cfg, &task).unwrap().unwrap(),
            "t1-diag-1"
        );
        assert_eq!(
            create_diagnostic(&store, &cfg, &task).unwrap().unwrap(),
            "t1-diag-2"
        );
        assert!(create_diagnostic(&store, &cfg, &task).unwrap().is_none());
    }

    #[test]
    fn completed_diagnostic_requeues_parent_with_fresh_budget() {
        let store = Store::open_in_memory().unwrap();
        let parent = failed_task(&store, "t1", "failed:max_retries");
        let diag_id = create_diagnostic(&store, &cfg(), &parent).unwrap().unwrap();

        // Walk the diagnostic to complete.
        for to in [Dispatched, Running, Evaluating, Complete] {
            transition(&store, &diag_id, to, "test", Fields::default()).unwrap();
        }
        let diag = store.find_task(&diag_id).unwrap().unwrap();
        let healed = on_diagnostic_complete(&store, &diag).unwrap();
        assert_eq!(healed.as_deref(), Some("t1"));

        let parent = store.find_task("t1").unwrap().unwrap();
        assert_eq!(parent.status, Queued);
        assert_eq!(parent.retries, 0);
        assert!(parent.error.is_none());
    }

    #[test]
    fn diagnostic_completion_ignores_already_requeued_parent() {
        let store = Store::open_in_memory().unwrap();
        let parent = failed_task(&store, "t1", "failed:max_retries");
        let diag_id = create_diagnostic(&store, &cfg(), &parent).unwrap().unwrap();
        for to in [Dispatched, Running, Evaluating, Complete] {
            transition(&store, &diag_id, to, "test", Fields::default()).unwrap();
        }
        // Operator already reset the parent by hand.
        machine::reset(&store, "t1").unwrap();

        let diag = store.find_task(&diag_id).unwrap().unwrap();
        assert!(on_diagnostic_complete(&store, &diag).unwrap().is_none());
    }
}
