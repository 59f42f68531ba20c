//! Task state machine.
//!
//! The legal-transition set is written out exhaustively in [`is_legal`] so
//! that every rule is visible in one place and a new state is a mechanical
//! edit. Anything not listed is rejected.
//!
//! `transition()` applies all side-effects of a move in a single store
//! transaction and appends exactly one audit record. Batch completion is
//! checked after every mutation; newly completed batches are returned so the
//! caller can produce retrospectives and release triggers.

use anyhow::{bail, Result};

use crate::store::Store;
use crate::task::{utc_now, Batch, BatchStatus, Task, TaskState};

use TaskState::*;

/// The full legal-transition table. Terminal-for-lifecycle states
/// (`verified`, `cancelled`) allow nothing.
pub fn is_legal(from: TaskState, to: TaskState) -> bool {
    let allowed: &[TaskState] = match from {
        Queued => &[Dispatched, Cancelled],
        Dispatched => &[Running, Failed, Cancelled],
        Running => &[Evaluating, Failed, Cancelled],
        Evaluating => &[Complete, Retrying, Blocked, Failed, Queued],
        Retrying => &[Dispatched, Failed, Cancelled],
        Blocked => &[Queued, PrReview, Cancelled],
        Failed => &[Queued],
        Complete => &[PrReview, Deployed],
        PrReview => &[ReviewTriage, Merging, Blocked, Cancelled],
        ReviewTriage => &[Merging, Blocked, Dispatched, Cancelled],
        Merging => &[Merged, Blocked, Failed],
        Merged => &[Deploying, Deployed],
        Deploying => &[Deployed, Failed],
        Deployed => &[Verifying, Verified, Cancelled],
        Verifying => &[Verified, VerifyFailed],
        VerifyFailed => &[Verifying, Cancelled],
        Verified | Cancelled => &[],
    };
    allowed.contains(&to)
}

/// Optional field updates applied alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub log_file: Option<String>,
    pub pr_url: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    /// Null out worktree/branch/session (post-deploy cleanup).
    pub clear_workspace: bool,
}

impl Fields {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }

    pub fn pr_url(url: impl Into<String>) -> Self {
        Self {
            pr_url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// Move `task_id` to `to`, enforcing the legal-transition table.
///
/// Returns the updated task and any batches that became complete as a
/// result of this mutation.
pub fn transition(
    store: &Store,
    task_id: &str,
    to: TaskState,
    reason: &str,
    fields: Fields,
) -> Result<(Task, Vec<Batch>)> {
    apply(store, task_id, to, reason, fields, true)
}

/// Operator override: same side-effects, no legality check. The audit
/// record carries a `forced:` reason prefix so the log shows the break.
pub fn force_transition(
    store: &Store,
    task_id: &str,
    to: TaskState,
    reason: &str,
    fields: Fields,
) -> Result<(Task, Vec<Batch>)> {
    let reason = format!("forced: {reason}");
    apply(store, task_id, to, &reason, fields, false)
}

fn apply(
    store: &Store,
    task_id: &str,
    to: TaskState,
    reason: &str,
    fields: Fields,
    check: bool,
) -> Result<(Task, Vec<Batch>)> {
    store.with_transaction(|s| {
        let Some(mut task) = s.find_task(task_id)? else {
            bail!("unknown task {task_id}");
        };
        let from = task.status;
        if check && !is_legal(from, to) {
            bail!("illegal transition {} → {} for {task_id}", from, to);
        }

        let now = utc_now();
        task.status = to;
        task.updated_at = now.clone();
        if from == Queued && to == Dispatched && task.started_at.is_none() {
            task.started_at = Some(now.clone());
        }
        if to.is_terminal_for_batch() && task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        if to == Retrying {
            // Clamped so the retries ≤ max_retries invariant survives a
            // reprompt issued at the limit.
            task.retries = (task.retries + 1).min(task.max_retries);
        }
        if fields.clear_workspace {
            task.worktree = None;
            task.branch = None;
            task.session_id = None;
        }
        if let Some(v) = fields.worktree {
            task.worktree = Some(v);
        }
        if let Some(v) = fields.branch {
            task.branch = Some(v);
        }
        if let Some(v) = fields.log_file {
            task.log_file = Some(v);
        }
        if let Some(v) = fields.pr_url {
            task.pr_url = Some(v);
        }
        if let Some(v) = fields.session_id {
            task.session_id = Some(v);
        }
        if let Some(v) = fields.error {
            task.error = Some(v);
        }

        s.save_task(&task)?;
        s.append_state_log(task_id, from.as_str(), to.as_str(), reason)?;

        let completed = check_batch_completion(s, task_id)?;
        Ok((task, completed))
    })
}

/// Return a terminal task to `queued` with counters and workspace fields
/// cleared. Audited like any other move.
pub fn reset(store: &Store, task_id: &str) -> Result<Task> {
    store.with_transaction(|s| {
        let Some(mut task) = s.find_task(task_id)? else {
            bail!("unknown task {task_id}");
        };
        let from = task.status;
        task.status = TaskState::Queued;
        task.retries = 0;
        task.session_id = None;
        task.worktree = None;
        task.branch = None;
        task.log_file = None;
        task.error = None;
        task.pr_url = None;
        task.started_at = None;
        task.completed_at = None;
        task.updated_at = utc_now();
        s.save_task(&task)?;
        s.append_state_log(task_id, from.as_str(), "queued", "reset")?;
        Ok(task)
    })
}

/// Mark owning batches complete when every member task is terminal.
///
/// Returns the batches that flipped to complete in this call (already-complete
/// batches are not re-reported).
pub fn check_batch_completion(store: &Store, task_id: &str) -> Result<Vec<Batch>> {
    let mut newly_complete = Vec::new();
    for batch in store.batches_for_task(task_id)? {
        if batch.status != BatchStatus::Active && batch.status != BatchStatus::Paused {
            continue;
        }
        let members = store.batch_tasks(batch.id)?;
        if !members.is_empty() && members.iter().all(|t| t.status.is_terminal_for_batch()) {
            store.set_batch_status(batch.id, BatchStatus::Complete)?;
            let mut done = batch.clone();
            done.status = BatchStatus::Complete;
            newly_complete.push(done);
        }
    }
    Ok(newly_complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::task::{ReleaseType, ALL_STATES};

    fn store_with_task(id: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.insert_task(id, "/repos/demo", "demo", "coding", 3).unwrap();
        store
    }

    fn walk(store: &Store, id: &str, path: &[TaskState]) {
        for &to in path {
            transition(store, id, to, "test", Fields::default()).unwrap();
        }
    }

    // ── Table ────────────────────────────────────────────────────────────────

    #[test]
    fn legal_pairs_from_every_nonterminal_state() {
        // Exhaustive probe: every (from, to) pair against the expected table.
        let expect: &[(TaskState, &[TaskState])] = &[
            (Queued, &[Dispatched, Cancelled]),
            (Dispatched, &[Running, Failed, Cancelled]),
            (Running, &[Evaluating, Failed, Cancelled]),
            (Evaluating, &[Complete, Retrying, Blocked, Failed, Queued]),
            (Retrying, &[Dispatched, Failed, Cancelled]),
            (Blocked, &[Queued, PrReview, Cancelled]),
            (Failed, &[Queued]),
            (Complete, &[PrReview, Deployed]),
            (PrReview, &[ReviewTriage, Merging, Blocked, Cancelled]),
            (ReviewTriage, &[Merging, Blocked, Dispatched, Cancelled]),
            (Merging, &[Merged, Blocked, Failed]),
            (Merged, &[Deploying, Deployed]),
            (Deploying, &[Deployed, Failed]),
            (Deployed, &[Verifying, Verified, Cancelled]),
            (Verifying, &[Verified, VerifyFailed]),
            (VerifyFailed, &[Verifying, Cancelled]),
            (Verified, &[]),
            (Cancelled, &[]),
        ];
        for (from, legal) in expect {
            for to in ALL_STATES {
                assert_eq!(
                    is_legal(*from, to),
                    legal.contains(&to),
                    "{from} → {to}"
                );
            }
        }
    }

    #[test]
    fn no_self_loops_in_table() {
        for state in ALL_STATES {
            assert!(!is_legal(state, state), "{state} → {state} must be illegal");
        }
    }

    // ── transition() ─────────────────────────────────────────────────────────

    #[test]
    fn illegal_transition_rejected_and_nothing_written() {
        let store = store_with_task("t1");
        let err = transition(&store, "t1", Merged, "bad", Fields::default()).unwrap_err();
        assert!(err.to_string().contains("illegal transition"));

        let task = store.find_task("t1").unwrap().unwrap();
        assert_eq!(task.status, Queued);
        assert_eq!(store.state_log("t1").unwrap().len(), 1); // only the insert entry
    }

    #[test]
    fn dispatch_sets_started_at_once() {
        let store = store_with_task("t1");
        let (task, _) = transition(
            &store,
            "t1",
            Dispatched,
            "dispatch",
            Fields {
                worktree: Some("/wt".into()),
                branch: Some("feature/t1".into()),
                log_file: Some("/log".into()),
                ..Fields::default()
            },
        )
        .unwrap();
        let first_started = task.started_at.clone().unwrap();
        assert_eq!(task.worktree.as_deref(), Some("/wt"));

        // Round-trip back through retry; started_at must not move.
        walk(&store, "t1", &[Running, Evaluating, Retrying, Dispatched]);
        let task = store.find_task("t1").unwrap().unwrap();
        assert_eq!(task.started_at.unwrap(), first_started);
    }

    #[test]
    fn retrying_increments_and_clamps_retries() {
        let store = store_with_task("t1");
        walk(&store, "t1", &[Dispatched, Running, Evaluating]);
        for expected in [1u32, 2, 3, 3] {
            transition(&store, "t1", Retrying, "retry", Fields::default()).unwrap();
            let task = store.find_task("t1").unwrap().unwrap();
            assert_eq!(task.retries, expected);
            assert!(task.retries <= task.max_retries);
            walk(&store, "t1", &[Dispatched, Running, Evaluating]);
        }
    }

    #[test]
    fn terminal_state_sets_completed_at() {
        let store = store_with_task("t1");
        walk(&store, "t1", &[Dispatched, Running, Evaluating, Complete]);
        let task = store.find_task("t1").unwrap().unwrap();
        let completed = task.completed_at.unwrap();
        assert!(completed >= task.started_at.unwrap());
    }

    #[test]
    fn audit_log_forms_legal_path() {
        let store = store_with_task("t1");
        walk(
            &store,
            "t1",
            &[Dispatched, Running, Evaluating, Complete, PrReview, Merging, Merged],
        );
        let log = store.state_log("t1").unwrap();
        assert_eq!(log.len(), 8);
        for entry in &log[1..] {
            let from = TaskState::parse(&entry.from_state).unwrap();
            let to = TaskState::parse(&entry.to_state).unwrap();
            assert!(is_legal(from, to), "{} → {}", entry.from_state, entry.to_state);
        }
    }

    #[test]
    fn forced_transition_audited_with_prefix() {
        let store = store_with_task("t1");
        force_transition(&store, "t1", Merged, "operator override", Fields::default()).unwrap();
        let log = store.state_log("t1").unwrap();
        assert_eq!(log.last().unwrap().reason, "forced: operator override");
        assert_eq!(store.find_task("t1").unwrap().unwrap().status, Merged);
    }

    #[test]
    fn reset_clears_workspace_fields_and_retries() {
        let store = store_with_task("t1");
        walk(&store, "t1", &[Dispatched, Running, Evaluating, Retrying]);
        transition(&store, "t1", Failed, "gave up", Fields::error("boom")).unwrap();

        let task = reset(&store, "t1").unwrap();
        assert_eq!(task.status, Queued);
        assert_eq!(task.retries, 0);
        assert!(task.worktree.is_none());
        assert!(task.log_file.is_none());
        assert!(task.pr_url.is_none());
        assert!(task.error.is_none());
        assert!(task.completed_at.is_none());
    }

    // ── Batch completion ─────────────────────────────────────────────────────

    #[test]
    fn batch_completes_when_all_members_terminal() {
        let store = Store::open_in_memory().unwrap();
        store.insert_task("t1", "/r", "", "coding", 3).unwrap();
        store.insert_task("t2", "/r", "", "coding", 3).unwrap();
        let batch = store
            .insert_batch("b", 4, 2, false, ReleaseType::Patch)
            .unwrap();
        store.add_task_to_batch(batch.id, "t1").unwrap();
        store.add_task_to_batch(batch.id, "t2").unwrap();

        let (_, completed) = transition(&store, "t1", Cancelled, "cancel", Fields::default()).unwrap();
        assert!(completed.is_empty(), "one member still queued");

        walk(&store, "t2", &[Dispatched, Running, Evaluating]);
        let (_, completed) = transition(&store, "t2", Complete, "done", Fields::default()).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "b");
        assert_eq!(
            store.find_batch("b").unwrap().unwrap().status,
            BatchStatus::Complete
        );

        // Further mutations do not re-report the batch.
        let (_, again) = transition(&store, "t2", PrReview, "pr", Fields::default()).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn empty_batch_never_autocompletes() {
        let store = Store::open_in_memory().unwrap();
        store.insert_task("t1", "/r", "", "coding", 3).unwrap();
        store.insert_batch("empty", 4, 2, false, ReleaseType::Patch).unwrap();
        transition(&store, "t1", Cancelled, "cancel", Fields::default()).unwrap();
        assert_eq!(
            store.find_batch("empty").unwrap().unwrap().status,
            BatchStatus::Active
        );
    }
}
