//! Post-PR lifecycle handler.
//!
//! Once a worker produces a PR and exits, the supervisor owns the rest:
//! CI-wait → review triage → merge → postflight → deploy → verify. Each
//! pulse advances a task at most one stage; nothing here blocks on CI.
//!
//! Stage decisions are pure functions over gateway snapshots so the whole
//! ladder is testable with a mock gateway.

use anyhow::Result;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::gh::{ChecksOutcome, GitHubGateway, PrState, PrStatus, ReviewDecision, ReviewThread};
use crate::machine::{self, Fields};
use crate::store::Store;
use crate::task::{Task, TaskState};
use crate::todo::{self, TodoUpdate};
use crate::{gitops, verify};

// ── pr_review ─────────────────────────────────────────────────────────────────

/// What the pr_review stage should do with a PR snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrReviewAction {
    /// Remote already shows it merged.
    AlreadyMerged,
    /// Closed without merging — human decision required.
    ClosedWithoutMerge,
    /// Draft, or checks still running: try again next pulse.
    Wait,
    /// A check failed.
    CiFailed,
    /// Reviewer asked for changes.
    ChangesRequested,
    /// Clean: move on to triage (or straight to merging).
    Proceed,
}

/// Pure pr_review decision, in the spec's priority order.
pub fn decide_pr_review(status: &PrStatus) -> PrReviewAction {
    match status.state {
        PrState::Merged => return PrReviewAction::AlreadyMerged,
        PrState::Closed => return PrReviewAction::ClosedWithoutMerge,
        PrState::Open => {}
    }
    if status.is_draft {
        return PrReviewAction::Wait;
    }
    match status.checks {
        ChecksOutcome::Failing => return PrReviewAction::CiFailed,
        ChecksOutcome::Pending => return PrReviewAction::Wait,
        ChecksOutcome::Passing => {}
    }
    if status.review_decision == ReviewDecision::ChangesRequested {
        return PrReviewAction::ChangesRequested;
    }
    PrReviewAction::Proceed
}

// ── review_triage ─────────────────────────────────────────────────────────────

/// Severity of one unresolved review thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Dismiss,
    Low,
    Medium,
    High,
    Critical,
}

/// Keyword classification of a review-thread body. Unrecognised feedback
/// lands on Medium so it gets a fix worker rather than a silent merge.
pub fn classify_thread(body: &str) -> Severity {
    let lower = body.to_lowercase();
    if lower.contains("outdated") || lower.contains("disregard") || lower.contains("obsolete") {
        return Severity::Dismiss;
    }
    if lower.contains("critical")
        || lower.contains("security")
        || lower.contains("vulnerab")
        || lower.contains("data loss")
    {
        return Severity::Critical;
    }
    if lower.contains("nit") || lower.contains("typo") || lower.contains("style") || lower.contains("minor")
    {
        return Severity::Low;
    }
    if lower.contains("must") || lower.contains("broken") || lower.contains("incorrect") || lower.contains("bug")
    {
        return Severity::High;
    }
    Severity::Medium
}

/// What triage should do given the worst unresolved feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageAction {
    Block,
    DispatchFix,
    Merge,
}

pub fn decide_triage(severities: &[Severity]) -> TriageAction {
    match severities.iter().max() {
        Some(Severity::Critical) => TriageAction::Block,
        Some(Severity::High) | Some(Severity::Medium) => TriageAction::DispatchFix,
        Some(Severity::Low) | Some(Severity::Dismiss) | None => TriageAction::Merge,
    }
}

// ── Stage stepping ────────────────────────────────────────────────────────────

/// Advance one task one lifecycle stage. Returns a short note for the pulse
/// summary.
pub fn advance<G: GitHubGateway>(
    store: &Store,
    cfg: &Config,
    gh: &G,
    task: &Task,
) -> Result<String> {
    match task.status {
        TaskState::Complete => step_complete(store, task),
        TaskState::PrReview => step_pr_review(store, cfg, gh, task),
        TaskState::ReviewTriage => step_review_triage(store, cfg, gh, task),
        TaskState::Merging => step_merging(store, gh, task),
        TaskState::Merged => step_merged(store, gh, task),
        TaskState::Deploying => step_deploying(store, cfg, task),
        other => Ok(format!("{}: no lifecycle stage for {other}", task.id)),
    }
}

fn step_complete(store: &Store, task: &Task) -> Result<String> {
    if task.pr_url.is_some() {
        machine::transition(store, &task.id, TaskState::PrReview, "PR awaiting CI", Fields::default())?;
        Ok(format!("{}: complete → pr_review", task.id))
    } else {
        // Nothing to merge; skip straight to the deploy/verify tail.
        machine::transition(store, &task.id, TaskState::Deployed, "complete without PR", Fields::default())?;
        Ok(format!("{}: complete → deployed (no PR)", task.id))
    }
}

fn step_pr_review<G: GitHubGateway>(
    store: &Store,
    cfg: &Config,
    gh: &G,
    task: &Task,
) -> Result<String> {
    let Some(pr_url) = task.pr_url.as_deref() else {
        return Ok(format!("{}: pr_review without pr_url, waiting for orphan scan", task.id));
    };
    let repo = Path::new(&task.repo);
    let status = gh.pr_status(repo, pr_url)?;

    let (to, reason) = match decide_pr_review(&status) {
        PrReviewAction::AlreadyMerged => (TaskState::Merging, "remote already merged"),
        PrReviewAction::ClosedWithoutMerge => (TaskState::Blocked, "pr_closed_without_merge"),
        PrReviewAction::Wait => return Ok(format!("{}: pr_review waiting (draft/checks)", task.id)),
        PrReviewAction::CiFailed => (TaskState::Blocked, "ci_failed"),
        PrReviewAction::ChangesRequested => (TaskState::Blocked, "changes_requested"),
        PrReviewAction::Proceed => {
            if cfg.skip_review_triage {
                (TaskState::Merging, "checks green, triage skipped")
            } else {
                (TaskState::ReviewTriage, "checks green")
            }
        }
    };

    let fields = if to == TaskState::Blocked {
        Fields::error(format!("blocked:{reason}"))
    } else {
        Fields::default()
    };
    machine::transition(store, &task.id, to, reason, fields)?;

    // A PR that was merged out-of-band skips the merge call next pulse.
    if to == TaskState::Merging && status.state == PrState::Merged {
        machine::transition(store, &task.id, TaskState::Merged, "remote already merged", Fields::default())?;
        return Ok(format!("{}: pr_review → merged (out-of-band)", task.id));
    }
    Ok(format!("{}: pr_review → {to}", task.id))
}

fn step_review_triage<G: GitHubGateway>(
    store: &Store,
    cfg: &Config,
    gh: &G,
    task: &Task,
) -> Result<String> {
    let Some(pr_url) = task.pr_url.as_deref() else {
        machine::transition(store, &task.id, TaskState::Merging, "no PR to triage", Fields::default())?;
        return Ok(format!("{}: review_triage → merging (no PR)", task.id));
    };
    let repo = Path::new(&task.repo);
    let threads = gh.unresolved_threads(repo, pr_url)?;
    let severities: Vec<Severity> = threads.iter().map(|t| classify_thread(&t.body)).collect();

    match decide_triage(&severities) {
        TriageAction::Block => {
            machine::transition(
                store,
                &task.id,
                TaskState::Blocked,
                "critical review feedback",
                Fields::error("blocked:critical_review_feedback"),
            )?;
            Ok(format!("{}: review_triage → blocked (critical)", task.id))
        }
        TriageAction::DispatchFix => {
            let feedback = format_feedback(&threads);
            let dispatcher = Dispatcher::new(store, cfg);
            dispatcher.dispatch_fix(&task.id, &feedback)?;
            Ok(format!("{}: review_triage → dispatched (fix worker)", task.id))
        }
        TriageAction::Merge => {
            machine::transition(store, &task.id, TaskState::Merging, "feedback low/dismissed", Fields::default())?;
            Ok(format!("{}: review_triage → merging", task.id))
        }
    }
}

fn format_feedback(threads: &[ReviewThread]) -> String {
    threads
        .iter()
        .filter(|t| !t.body.trim().is_empty())
        .map(|t| format!("- {}", t.body.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn step_merging<G: GitHubGateway>(store: &Store, gh: &G, task: &Task) -> Result<String> {
    let Some(pr_url) = task.pr_url.as_deref() else {
        machine::transition(store, &task.id, TaskState::Merged, "nothing to merge", Fields::default())?;
        return Ok(format!("{}: merging → merged (no PR)", task.id));
    };
    let repo = Path::new(&task.repo);
    match gh.merge_pr(repo, pr_url) {
        Ok(()) => {
            machine::transition(store, &task.id, TaskState::Merged, "squash merged", Fields::default())?;
            Ok(format!("{}: merging → merged", task.id))
        }
        Err(e) => {
            // Racing CI or branch protection; a human untangles it.
            machine::transition(
                store,
                &task.id,
                TaskState::Blocked,
                "merge failed",
                Fields::error(format!("blocked:merge_failed: {e}")),
            )?;
            Ok(format!("{}: merging → blocked", task.id))
        }
    }
}

fn step_merged<G: GitHubGateway>(store: &Store, gh: &G, task: &Task) -> Result<String> {
    let repo = Path::new(&task.repo);
    // Postflight: sync the default branch and confirm the remote agrees.
    if !gitops::pull_ff_only(repo) {
        eprintln!("[{}] warning: ff-only pull of default branch failed", task.id);
    }
    if let Some(pr_url) = task.pr_url.as_deref() {
        match gh.pr_is_merged(repo, pr_url) {
            Ok(true) => {}
            Ok(false) => eprintln!("[{}] warning: remote does not show {pr_url} merged", task.id),
            Err(e) => eprintln!("[{}] warning: merge confirmation failed: {e}", task.id),
        }
    }
    machine::transition(store, &task.id, TaskState::Deploying, "postflight done", Fields::default())?;
    Ok(format!("{}: merged → deploying", task.id))
}

fn step_deploying(store: &Store, cfg: &Config, task: &Task) -> Result<String> {
    let repo = Path::new(&task.repo);

    // Deploy script is a soft step: a failing deploy warns, never blocks.
    if let Some(script) = find_deploy_script(repo) {
        let ok = Command::new("bash")
            .arg(&script)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            eprintln!("[{}] warning: deploy script {script} exited non-zero", task.id);
        }
    }

    // Workspace cleanup: worktree gone, remote branch gone, fields cleared.
    if let Some(wt) = task.worktree.as_deref() {
        gitops::remove_worktree(repo, Path::new(wt));
    }
    if let Some(branch) = task.branch.as_deref() {
        gitops::delete_remote_branch(repo, branch);
    }

    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let _ = todo::update_todo(
        repo,
        &cfg.locks_dir(),
        &task.id,
        &TodoUpdate::Complete {
            date: today,
            pr_url: task.pr_url.clone(),
        },
    );

    machine::transition(
        store,
        &task.id,
        TaskState::Deployed,
        "deployed and cleaned up",
        Fields {
            clear_workspace: true,
            ..Fields::default()
        },
    )?;
    Ok(format!("{}: deploying → deployed", task.id))
}

/// Deploy script convention: a `.deployable` marker naming the script, or a
/// bare `deploy.sh` / `setup.sh` in the repo root.
fn find_deploy_script(repo: &Path) -> Option<String> {
    if let Ok(marker) = std::fs::read_to_string(repo.join(".deployable")) {
        let name = marker.lines().next().unwrap_or("").trim();
        let script = if name.is_empty() { "deploy.sh" } else { name };
        if repo.join(script).exists() {
            return Some(script.to_string());
        }
    }
    for candidate in ["deploy.sh", "setup.sh"] {
        if repo.join(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}

// ── Verification stage ────────────────────────────────────────────────────────

/// Run the deployed→verifying→verified|verify_failed tail for one task.
pub fn run_verification(store: &Store, task: &Task) -> Result<String> {
    machine::transition(store, &task.id, TaskState::Verifying, "running VERIFY.md directives", Fields::default())?;

    let repo = Path::new(&task.repo);
    let report = verify::verify_task(repo, &task.id, "supervisor")?;

    if report.all_passed {
        let note = if report.no_directives() {
            "no directives declared"
        } else {
            "all directives passed"
        };
        machine::transition(store, &task.id, TaskState::Verified, note, Fields::default())?;
        Ok(format!("{}: verified ({note})", task.id))
    } else {
        machine::transition(
            store,
            &task.id,
            TaskState::VerifyFailed,
            "directive failed",
            Fields::error("verify_failed"),
        )?;
        Ok(format!("{}: verify_failed", task.id))
    }
}
