//! Pulse driver.
//!
//! One short, stateless, run-to-completion cycle that advances every task at
//! most one step. Safe to fire from cron, a file watcher, or a human; the
//! pulse lock guarantees at most one runs at a time. Every phase is
//! best-effort — a failure is logged and the pulse moves on.

use anyhow::Result;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::evaluate::{self, Verdict};
use crate::gh::{GhCli, GitHubGateway};
use crate::health::HealthProbe;
use crate::lock::{LockAttempt, PulseLock};
use crate::machine::{self, Fields};
use crate::store::{Store, TaskFilter};
use crate::task::{utc_now, BatchStatus, Task, TaskState};
use crate::todo::{self, TodoUpdate};
use crate::verdict::{CliVerdictClient, VerdictClient};
use crate::{events, gitops, heal, hooks, hygiene, lifecycle, memory, pidfile, proc, retro, sysinfo};

/// Minimum gap between orphaned-PR scans.
const ORPHAN_SCAN_INTERVAL: Duration = Duration::from_secs(600);

/// Counters reported at the end of a pulse.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PulseSummary {
    pub picked_up: u32,
    pub evaluated: u32,
    pub completed: u32,
    pub retried: u32,
    pub blocked: u32,
    pub failed: u32,
    pub dispatched: u32,
    pub lifecycle_steps: u32,
    pub verified: u32,
    pub verify_failed: u32,
    pub orphans_linked: u32,
    pub hygiene_actions: u32,
    pub batches_completed: u32,
    pub skipped_lock: bool,
}

impl PulseSummary {
    /// Render the stderr summary table.
    pub fn render(&self) -> String {
        if self.skipped_lock {
            return "pulse: another pulse is running, skipped".to_string();
        }
        format!(
            "pulse summary\n\
             ─────────────────────────────\n\
             picked up        {:>5}\n\
             evaluated        {:>5}\n\
             · complete       {:>5}\n\
             · retry          {:>5}\n\
             · blocked        {:>5}\n\
             · failed         {:>5}\n\
             dispatched       {:>5}\n\
             lifecycle steps  {:>5}\n\
             verified         {:>5}\n\
             verify failed    {:>5}\n\
             orphan PRs       {:>5}\n\
             hygiene actions  {:>5}\n\
             batches complete {:>5}",
            self.picked_up,
            self.evaluated,
            self.completed,
            self.retried,
            self.blocked,
            self.failed,
            self.dispatched,
            self.lifecycle_steps,
            self.verified,
            self.verify_failed,
            self.orphans_linked,
            self.hygiene_actions,
            self.batches_completed,
        )
    }
}

/// Resume pointer written before a self-respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub phase: u8,
    pub batch_filter: Option<String>,
}

pub fn write_resume(path: &Path, point: &ResumePoint) -> Result<()> {
    let v = json!({ "phase": point.phase, "batch_filter": point.batch_filter });
    std::fs::write(path, serde_json::to_string(&v)?)?;
    Ok(())
}

/// A missing or unreadable pointer means a fresh pulse.
pub fn read_resume(path: &Path) -> Option<ResumePoint> {
    let content = std::fs::read_to_string(path).ok()?;
    let v: serde_json::Value = serde_json::from_str(&content).ok()?;
    let point = ResumePoint {
        phase: v["phase"].as_u64()? as u8,
        batch_filter: v["batch_filter"].as_str().map(str::to_string),
    };
    let _ = std::fs::remove_file(path);
    Some(point)
}

/// Resident set of this process in MB, from `/proc/self/status`.
/// None on hosts without procfs — the memory check degrades to a no-op.
pub fn self_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_mb(&status)
}

pub fn parse_vm_rss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// This supervisor's claim identity for TODO.md assignee tokens.
pub fn identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "supervisor".to_string())
}

/// Base concurrency for an auto-created batch.
pub fn auto_batch_concurrency(cpu_cores: u32) -> u32 {
    (cpu_cores / 2).max(2)
}

/// Run one pulse. `start_phase` comes from a resume pointer (1 = full run).
/// Returns Some(resume) when the self-memory check asked for a respawn.
pub fn run(
    store: &Store,
    cfg: &Config,
    batch_filter: Option<&str>,
    start_phase: u8,
) -> Result<(PulseSummary, Option<ResumePoint>)> {
    let mut summary = PulseSummary::default();

    let _lock = match PulseLock::acquire(&cfg.pulse_lock_path(), cfg.pulse_lock_timeout)? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Busy { holder_pid } => {
            eprintln!("pulse: lock held by pid {holder_pid}, exiting");
            summary.skipped_lock = true;
            return Ok((summary, None));
        }
    };

    // Batches already complete before this pulse — phase 8 reports only new ones.
    let complete_before: Vec<i64> = store
        .list_batches(Some(BatchStatus::Complete))?
        .iter()
        .map(|b| b.id)
        .collect();

    let gh = GhCli;
    let mut health = HealthProbe::new(cfg.health_dir());

    let phases: [(u8, &str); 9] = [
        (1, "auto-pickup"),
        (2, "worker check"),
        (3, "dispatch"),
        (4, "post-PR lifecycle"),
        (5, "verification"),
        (6, "orphaned-PR scan"),
        (7, "hygiene"),
        (8, "retrospective"),
        (9, "self-memory check"),
    ];
    for (phase, name) in phases {
        if phase < start_phase {
            continue;
        }
        let result = match phase {
            1 => phase_pickup(store, cfg, &mut summary),
            2 => phase_worker_check(store, cfg, &mut summary),
            3 => phase_dispatch(store, cfg, batch_filter, &mut health, &mut summary),
            4 => phase_lifecycle(store, cfg, &gh, &mut summary),
            5 => phase_verification(store, &mut summary),
            6 => phase_orphan_scan(store, cfg, &gh, &mut summary),
            7 => phase_hygiene(store, cfg, &mut summary),
            8 => phase_retro(store, cfg, &complete_before, &mut summary),
            9 => Ok(()),
            _ => Ok(()),
        };
        if let Err(e) = result {
            eprintln!("pulse: phase {phase} ({name}) failed: {e:#}");
        }
        // Phase 9: the memory check decides whether to respawn with a
        // resume pointer instead of finishing in-process.
        if phase == 9 {
            if let Some(rss) = self_rss_mb() {
                if rss > cfg.self_mem_limit_mb {
                    let point = ResumePoint {
                        phase: 1,
                        batch_filter: batch_filter.map(str::to_string),
                    };
                    write_resume(&cfg.resume_path(), &point)?;
                    emit_pulse_event(cfg, &summary);
                    return Ok((summary, Some(point)));
                }
            }
        }
    }

    emit_pulse_event(cfg, &summary);
    Ok((summary, None))
}

fn emit_pulse_event(cfg: &Config, s: &PulseSummary) {
    let payload = serde_json::to_value(s).unwrap_or_else(|_| json!({}));
    events::emit(&cfg.events_path(), "pulse", payload);
}

// ── Phase 1: auto-pickup ──────────────────────────────────────────────────────

fn phase_pickup(store: &Store, cfg: &Config, summary: &mut PulseSummary) -> Result<()> {
    let me = identity();
    for repo in known_repos(store)? {
        let repo_path = Path::new(&repo);
        let Ok(content) = std::fs::read_to_string(repo_path.join("TODO.md")) else {
            continue;
        };
        let candidates = todo::pickup_candidates(&todo::parse_todo(&content), &me);
        for cand in candidates {
            if store.find_task(&cand.id)?.is_some() {
                continue;
            }
            // Stake the claim before dispatching; a lost push race means
            // another supervisor owns the line now.
            let _ = todo::claim_task(repo_path, &cfg.locks_dir(), &cand.id, &me);
            let reread = std::fs::read_to_string(repo_path.join("TODO.md")).unwrap_or_default();
            let still_ours = todo::parse_todo(&reread)
                .iter()
                .find(|t| t.id == cand.id)
                .map(|t| t.assignee.as_deref().is_none_or(|a| a == me))
                .unwrap_or(false);
            if !still_ours {
                continue;
            }

            store.insert_task(&cand.id, &repo, &cand.title, &cfg.default_model, 3)?;
            let batch = active_or_auto_batch(store, cfg)?;
            store.add_task_to_batch(batch, &cand.id)?;
            summary.picked_up += 1;
            println!("[{}] picked up from TODO.md", cand.id);
        }
    }
    Ok(())
}

fn known_repos(store: &Store) -> Result<Vec<String>> {
    let mut repos: Vec<String> = store
        .list_tasks(&TaskFilter::default())?
        .into_iter()
        .map(|t| t.repo)
        .collect();
    repos.sort();
    repos.dedup();
    Ok(repos)
}

fn active_or_auto_batch(store: &Store, _cfg: &Config) -> Result<i64> {
    let active = store.list_batches(Some(BatchStatus::Active))?;
    if let Some(batch) = active.last() {
        return Ok(batch.id);
    }
    let name = format!("auto-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    let batch = store.insert_batch(
        &name,
        auto_batch_concurrency(sysinfo::cpu_cores()),
        2,
        false,
        crate::task::ReleaseType::Patch,
    )?;
    Ok(batch.id)
}

// ── Phase 2: worker check & evaluate ──────────────────────────────────────────

fn phase_worker_check(store: &Store, cfg: &Config, summary: &mut PulseSummary) -> Result<()> {
    let watched = store.list_tasks(&TaskFilter::by_status(&[
        TaskState::Running,
        TaskState::Dispatched,
        TaskState::Evaluating,
    ]))?;

    for task in watched {
        match task.status {
            TaskState::Running => {
                if worker_overdue(cfg, &task) {
                    if let Some(pid) = task.worker_pid() {
                        proc::kill_tree(pid);
                    }
                    machine::transition(
                        store,
                        &task.id,
                        TaskState::Evaluating,
                        "worker timeout",
                        Fields::default(),
                    )?;
                    evaluate_one(store, cfg, &task.id, summary)?;
                } else if !pidfile::worker_alive(&cfg.pids_dir(), &task.id) {
                    machine::transition(
                        store,
                        &task.id,
                        TaskState::Evaluating,
                        "worker exited",
                        Fields::default(),
                    )?;
                    evaluate_one(store, cfg, &task.id, summary)?;
                }
            }
            TaskState::Dispatched => {
                // Launch is immediately followed by the running transition;
                // a lingering dispatched task lost its worker.
                if !pidfile::worker_alive(&cfg.pids_dir(), &task.id) && older_than(&task.updated_at, 120)
                {
                    machine::transition(
                        store,
                        &task.id,
                        TaskState::Failed,
                        "worker never reached running",
                        Fields::error("failed:launch_lost"),
                    )?;
                    summary.failed += 1;
                    apply_failure_side_effects(store, cfg, &task.id)?;
                }
            }
            TaskState::Evaluating => {
                // A previous pulse died mid-evaluation; finish the job.
                evaluate_one(store, cfg, &task.id, summary)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn worker_overdue(cfg: &Config, task: &Task) -> bool {
    if !pidfile::worker_alive(&cfg.pids_dir(), &task.id) {
        return false;
    }
    std::fs::metadata(pidfile::pid_path(&cfg.pids_dir(), &task.id))
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > cfg.worker_timeout)
}

fn older_than(ts: &str, secs: i64) -> bool {
    chrono::DateTime::parse_from_rfc3339(&ts.replace('Z', "+00:00"))
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds() > secs)
        .unwrap_or(true)
}

/// Evaluate one task sitting in `evaluating` and apply the verdict.
pub fn evaluate_one(
    store: &Store,
    cfg: &Config,
    task_id: &str,
    summary: &mut PulseSummary,
) -> Result<()> {
    let Some(task) = store.find_task(task_id)? else {
        return Ok(());
    };
    if task.status != TaskState::Evaluating {
        return Ok(());
    }
    summary.evaluated += 1;

    let git = task
        .worktree
        .as_deref()
        .and_then(|wt| gitops::gather_evidence(Path::new(&task.repo), Path::new(wt)));
    let ai = CliVerdictClient {
        cli: cfg.eval_cli.clone(),
        model: cfg.eval_model.clone(),
    };
    let log_path = task.log_file.clone().unwrap_or_default();
    let evaluation = evaluate::evaluate_task(
        Path::new(&log_path),
        &task.description,
        task.retries,
        task.max_retries,
        git,
        Some(&ai as &dyn VerdictClient),
    )?;

    if let Some(line) = &evaluation.ai_verdict_line {
        store.append_state_log(&task.id, "evaluating", "evaluating", &format!("AI eval verdict: {line}"))?;
    }
    apply_verdict(store, cfg, &task, &evaluation.verdict, summary)
}

/// Apply an evaluator verdict: transition, retry via reprompt, self-heal,
/// TODO mirror, notification hook, memory lesson.
pub fn apply_verdict(
    store: &Store,
    cfg: &Config,
    task: &Task,
    verdict: &Verdict,
    summary: &mut PulseSummary,
) -> Result<()> {
    let wire = verdict.as_wire();
    match verdict {
        Verdict::Complete(detail) => {
            summary.completed += 1;
            let fields = if detail.starts_with("https://") {
                Fields::pr_url(detail.clone())
            } else {
                Fields::default()
            };
            machine::transition(store, &task.id, TaskState::Complete, &wire, fields)?;
            // Commits without a PR: push the branch so the orphan scan (or a
            // human) can open one.
            if detail == "commits_only" {
                if let (Some(wt), Some(branch)) = (task.worktree.as_deref(), task.branch.as_deref()) {
                    let _ = gitops::push_branch(Path::new(wt), branch);
                }
            }
            hooks::fire_task_hook(&cfg.hooks_dir(), "complete", &task.id, &task.repo, detail);
            events::emit(&cfg.events_path(), "task_complete", json!({"task": task.id, "detail": detail}));
            // A completed diagnostic heals its parent.
            if task.is_diagnostic() {
                if let Some(refreshed) = store.find_task(&task.id)? {
                    if let Some(parent) = heal::on_diagnostic_complete(store, &refreshed)? {
                        println!("[{parent}] requeued after diagnostic {}", task.id);
                    }
                }
            }
        }
        Verdict::Retry(reason) => {
            summary.retried += 1;
            machine::transition(
                store,
                &task.id,
                TaskState::Retrying,
                &wire,
                Fields::error(&wire),
            )?;
            let dispatcher = Dispatcher::new(store, cfg);
            let mut health = HealthProbe::new(cfg.health_dir());
            match dispatcher.reprompt(&task.id, None, &mut health)? {
                DispatchOutcome::Dispatched { .. } => {}
                DispatchOutcome::BlockedMaxRetries => {
                    apply_failure_side_effects(store, cfg, &task.id)?;
                }
                other => eprintln!("[{}] reprompt deferred: {other:?} ({reason})", task.id),
            }
        }
        Verdict::Blocked(_) => {
            summary.blocked += 1;
            machine::transition(store, &task.id, TaskState::Blocked, &wire, Fields::error(&wire))?;
            apply_failure_side_effects(store, cfg, &task.id)?;
        }
        Verdict::Failed(_) => {
            summary.failed += 1;
            machine::transition(store, &task.id, TaskState::Failed, &wire, Fields::error(&wire))?;
            apply_failure_side_effects(store, cfg, &task.id)?;
        }
    }
    Ok(())
}

/// Shared blocked/failed side-effects: TODO note, hook, memory lesson,
/// self-heal.
fn apply_failure_side_effects(store: &Store, cfg: &Config, task_id: &str) -> Result<()> {
    let Some(task) = store.find_task(task_id)? else {
        return Ok(());
    };
    let reason = task.error.clone().unwrap_or_else(|| "unknown".to_string());

    let _ = todo::update_todo(
        Path::new(&task.repo),
        &cfg.locks_dir(),
        &task.id,
        &TodoUpdate::Blocked {
            reason: reason.clone(),
        },
    );
    let event = if task.status == TaskState::Blocked { "blocked" } else { "failed" };
    hooks::fire_task_hook(&cfg.hooks_dir(), event, &task.id, &task.repo, &reason);
    events::emit(
        &cfg.events_path(),
        &format!("task_{event}"),
        json!({"task": task.id, "reason": reason}),
    );
    memory::record_lesson(&cfg.memory_dir(), &task.repo, &task.id, &reason);

    if let Some(diag_id) = heal::create_diagnostic(store, cfg, &task)? {
        println!("[{}] self-heal: created diagnostic {diag_id}", task.id);
    }
    Ok(())
}

// ── Phase 3: dispatch ─────────────────────────────────────────────────────────

fn phase_dispatch(
    store: &Store,
    cfg: &Config,
    batch_filter: Option<&str>,
    health: &mut HealthProbe,
    summary: &mut PulseSummary,
) -> Result<()> {
    let filter = TaskFilter {
        statuses: vec![TaskState::Queued],
        batch: batch_filter.map(str::to_string),
        ..TaskFilter::default()
    };
    let dispatcher = Dispatcher::new(store, cfg);

    for task in store.list_tasks(&filter)? {
        let batch = store.batches_for_task(&task.id)?.into_iter().next();
        if let Some(b) = &batch {
            if b.status == BatchStatus::Paused {
                continue;
            }
        }
        match dispatcher.dispatch(&task.id, batch.as_ref(), health)? {
            DispatchOutcome::Dispatched { pid } => {
                summary.dispatched += 1;
                println!("[{}] dispatched (pid {pid})", task.id);
            }
            DispatchOutcome::ConcurrencyLimited => continue,
            DispatchOutcome::ProviderUnavailable => {
                // Thundering-herd guard: no further dispatches this pulse.
                eprintln!("pulse: provider unavailable, dispatch halted");
                break;
            }
            DispatchOutcome::Failed(reason) => {
                summary.failed += 1;
                eprintln!("[{}] dispatch failed: {reason}", task.id);
                apply_failure_side_effects(store, cfg, &task.id)?;
            }
            DispatchOutcome::NotDispatchable(reason) => {
                eprintln!("[{}] not dispatchable: {reason}", task.id);
            }
            DispatchOutcome::BlockedMaxRetries => {}
        }
    }
    Ok(())
}

// ── Phase 4: post-PR lifecycle ────────────────────────────────────────────────

fn phase_lifecycle<G: GitHubGateway>(
    store: &Store,
    cfg: &Config,
    gh: &G,
    summary: &mut PulseSummary,
) -> Result<()> {
    let staged = store.list_tasks(&TaskFilter::by_status(&[
        TaskState::Complete,
        TaskState::PrReview,
        TaskState::ReviewTriage,
        TaskState::Merging,
        TaskState::Merged,
        TaskState::Deploying,
    ]))?;
    for task in staged {
        match lifecycle::advance(store, cfg, gh, &task) {
            Ok(note) => {
                summary.lifecycle_steps += 1;
                println!("{note}");
            }
            Err(e) => eprintln!("[{}] lifecycle step failed: {e:#}", task.id),
        }
    }
    Ok(())
}

// ── Phase 5: verification ─────────────────────────────────────────────────────

fn phase_verification(store: &Store, summary: &mut PulseSummary) -> Result<()> {
    for task in store.list_tasks(&TaskFilter::by_status(&[TaskState::Deployed]))? {
        match lifecycle::run_verification(store, &task) {
            Ok(note) => {
                if note.contains("verify_failed") {
                    summary.verify_failed += 1;
                } else {
                    summary.verified += 1;
                }
                println!("{note}");
            }
            Err(e) => eprintln!("[{}] verification failed to run: {e:#}", task.id),
        }
    }
    Ok(())
}

// ── Phase 6: orphaned-PR scan ─────────────────────────────────────────────────

fn phase_orphan_scan<G: GitHubGateway>(
    store: &Store,
    cfg: &Config,
    gh: &G,
    summary: &mut PulseSummary,
) -> Result<()> {
    let stamp = cfg.orphan_scan_stamp();
    let fresh = std::fs::metadata(&stamp)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age < ORPHAN_SCAN_INTERVAL);
    if fresh {
        return Ok(());
    }
    std::fs::create_dir_all(&cfg.data_dir)?;
    std::fs::write(&stamp, utc_now())?;

    let candidates = store.list_tasks(&TaskFilter::default())?;
    for task in candidates {
        if task.pr_url.is_some() || task.status == TaskState::Cancelled {
            continue;
        }
        let branch = task.branch.clone().unwrap_or_else(|| task.feature_branch());
        let Ok(Some(url)) = gh.find_pr_for_branch(Path::new(&task.repo), &branch) else {
            continue;
        };
        summary.orphans_linked += 1;
        let mut linked = task.clone();
        linked.pr_url = Some(url.clone());
        store.save_task(&linked)?;
        store.append_state_log(&task.id, task.status.as_str(), task.status.as_str(), &format!("orphaned PR linked: {url}"))?;

        // A failed/blocked task with a live PR gets another chance.
        match task.status {
            TaskState::Failed => {
                machine::transition(store, &task.id, TaskState::Queued, "orphaned PR linked", Fields::default())?;
            }
            TaskState::Blocked => {
                machine::transition(store, &task.id, TaskState::PrReview, "orphaned PR linked", Fields::default())?;
            }
            _ => {}
        }
        println!("[{}] linked orphaned PR {url}", task.id);
    }
    Ok(())
}

// ── Phase 7: hygiene ──────────────────────────────────────────────────────────

fn phase_hygiene(store: &Store, cfg: &Config, summary: &mut PulseSummary) -> Result<()> {
    let notes = hygiene::sweep(store, cfg)?;
    summary.hygiene_actions += notes.len() as u32;
    for note in notes {
        eprintln!("hygiene: {note}");
    }
    Ok(())
}

// ── Phase 8: retrospective & release ──────────────────────────────────────────

fn phase_retro(
    store: &Store,
    cfg: &Config,
    complete_before: &[i64],
    summary: &mut PulseSummary,
) -> Result<()> {
    for batch in store.list_batches(Some(BatchStatus::Complete))? {
        if complete_before.contains(&batch.id) {
            continue;
        }
        summary.batches_completed += 1;
        let path = retro::write_retrospective(store, cfg, &batch)?;
        println!("batch {}: retrospective at {}", batch.name, path.display());
        if let Some(release) = retro::enqueue_release(cfg, &batch)? {
            println!("batch {}: release trigger at {}", batch.name, release.display());
        }
        let _ = hooks::fire_hook(
            &cfg.hooks_dir(),
            "on-batch-complete",
            &[("SUPERVISOR_EVENT", "batch-complete"), ("SUPERVISOR_BATCH", &batch.name)],
        );
        events::emit(&cfg.events_path(), "batch_complete", json!({"batch": batch.name}));
    }
    Ok(())
}
