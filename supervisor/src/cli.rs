use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;

use supervisor_core::config::Config;
use supervisor_core::dispatch::{DispatchOutcome, Dispatcher};
use supervisor_core::evaluate;
use supervisor_core::gh::GhCli;
use supervisor_core::health::HealthProbe;
use supervisor_core::machine::{self, Fields};
use supervisor_core::pulse::{self, PulseSummary};
use supervisor_core::store::{Store, TaskFilter};
use supervisor_core::task::{BatchStatus, ReleaseType, TaskState, ALL_STATES};
use supervisor_core::verdict::{CliVerdictClient, VerdictClient};
use supervisor_core::{heal, hygiene, lifecycle};

use crate::{cron, watch};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("SUPERVISOR_GIT_HASH"), ")");

#[derive(Parser)]
#[command(
    name = "supervisor",
    version = VERSION,
    about = "Autonomous multi-task supervisor for AI coding workers",
    long_about = "Drives a fleet of worker processes through dispatch, retry, PR review, merge, \
deploy, and verification. Designed to be poked awake by cron, a file watcher, or a manual `pulse`; \
all state lives in a local database, so every invocation is stateless and restartable."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create or migrate the state store
    Init,

    /// Insert a new queued task
    Add {
        /// Task id (convention tNNN)
        id: String,

        /// Absolute path to the git repository (defaults to the current directory)
        #[arg(long)]
        repo: Option<String>,

        /// Freeform task description
        #[arg(long, default_value = "")]
        description: String,

        /// Worker model tier
        #[arg(long)]
        model: Option<String>,

        /// Retry budget
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Also open a tracker issue for this task
        #[arg(long)]
        with_issue: bool,
    },

    /// Create a batch and optionally enrol tasks
    Batch {
        name: String,

        /// Base concurrency budget
        #[arg(long, default_value_t = 4)]
        concurrency: u32,

        /// Load factor before hard throttling
        #[arg(long = "max-load", default_value_t = 2)]
        max_load: u32,

        /// Comma-separated task ids to enrol
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,

        /// Enqueue a release when the batch completes
        #[arg(long)]
        release_on_complete: bool,

        /// Release bump: major, minor, or patch
        #[arg(long, default_value = "patch")]
        release_type: String,
    },

    /// Force-dispatch one task (respects concurrency)
    Dispatch {
        id: String,

        /// Account against this batch's budget
        #[arg(long)]
        batch: Option<String>,
    },

    /// Re-launch a retrying task with context
    Reprompt {
        id: String,

        /// Extra context appended to the re-prompt
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Run the outcome evaluator on demand
    Evaluate {
        id: String,

        /// Skip the AI verdict tier
        #[arg(long)]
        no_ai: bool,
    },

    /// Run one driver cycle
    Pulse {
        /// Only dispatch tasks in this batch
        #[arg(long)]
        batch: Option<String>,

        /// Resume pointer written by a self-respawn
        #[arg(long)]
        resume: Option<String>,
    },

    /// Human-readable task, batch, or overall status
    Status {
        /// Task or batch identifier
        target: Option<String>,
    },

    /// Enumerate tasks
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,

        /// Filter by batch
        #[arg(long)]
        batch: Option<String>,

        /// Output format: table or json
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Force a transition (audited)
    Transition {
        id: String,
        state: String,

        /// Failure reason recorded on the task
        #[arg(long)]
        error: Option<String>,

        /// PR URL recorded on the task
        #[arg(long)]
        pr_url: Option<String>,
    },

    /// Return a terminal task to queued
    Reset { id: String },

    /// Cancel a task or a whole batch
    Cancel { target: String },

    /// Pause a batch (no new dispatches)
    Pause { batch: String },

    /// Resume a paused batch
    Resume { batch: String },

    /// Remove worktrees and PID files for terminal tasks
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },

    /// Emergency orphan-worker sweep
    #[command(name = "kill-workers")]
    KillWorkers {
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a task's PR (CI and review state)
    #[command(name = "pr-check")]
    PrCheck { id: String },

    /// Merge a task's PR
    #[command(name = "pr-merge")]
    PrMerge { id: String },

    /// Advance one post-PR lifecycle step
    #[command(name = "pr-lifecycle")]
    PrLifecycle { id: String },

    /// Run VERIFY.md directives for a deployed task
    Verify { id: String },

    /// Manage the cron-based pulse
    Cron {
        #[command(subcommand)]
        subcommand: CronCommands,
    },

    /// File-watch-driven pulse
    Watch {
        /// Watch a single repo instead of every known repo
        #[arg(long)]
        repo: Option<String>,
    },

    /// Force the self-healer for a task
    #[command(name = "self-heal")]
    SelfHeal { id: String },

    /// Diagnose setup problems and print fix commands
    Doctor,

    /// Admin access to the state store
    Db {
        /// SQL to execute; omit to print the database path
        sql: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CronCommands {
    /// Install a pulse crontab entry
    Install {
        /// Pulse interval in minutes
        #[arg(long, default_value_t = 5)]
        interval: u32,
    },
    /// Remove the pulse crontab entry
    Uninstall,
    /// Show the installed entry
    Status,
}

/// Entry point. Returns the process exit code:
/// 0 success, 1 user error, 2 concurrency-limited, 3 provider-unavailable.
pub fn run() -> i32 {
    let cli = Cli::parse();
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("supervisor: config error: {e:#}");
            return 1;
        }
    };
    match execute(&cli.command, &cfg) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("supervisor: {e:#}");
            1
        }
    }
}

fn open_store(cfg: &Config) -> Result<Store> {
    Store::open(&cfg.db_path())
}

fn execute(command: &Commands, cfg: &Config) -> Result<i32> {
    match command {
        Commands::Init => {
            open_store(cfg)?;
            println!("initialised {}", cfg.db_path().display());
            Ok(0)
        }

        Commands::Add {
            id,
            repo,
            description,
            model,
            max_retries,
            with_issue,
        } => cmd_add(cfg, id, repo.as_deref(), description, model.as_deref(), *max_retries, *with_issue),

        Commands::Batch {
            name,
            concurrency,
            max_load,
            tasks,
            release_on_complete,
            release_type,
        } => cmd_batch(cfg, name, *concurrency, *max_load, tasks, *release_on_complete, release_type),

        Commands::Dispatch { id, batch } => cmd_dispatch(cfg, id, batch.as_deref()),

        Commands::Reprompt { id, prompt } => {
            let store = open_store(cfg)?;
            let dispatcher = Dispatcher::new(&store, cfg);
            let mut health = HealthProbe::new(cfg.health_dir());
            match dispatcher.reprompt(id, prompt.as_deref(), &mut health)? {
                DispatchOutcome::Dispatched { pid } => {
                    println!("[{id}] relaunched (pid {pid})");
                    Ok(0)
                }
                DispatchOutcome::ProviderUnavailable => Ok(3),
                other => {
                    eprintln!("[{id}] reprompt: {other:?}");
                    Ok(1)
                }
            }
        }

        Commands::Evaluate { id, no_ai } => cmd_evaluate(cfg, id, *no_ai),

        Commands::Pulse { batch, resume } => cmd_pulse(cfg, batch.as_deref(), resume.as_deref()),

        Commands::Status { target } => cmd_status(cfg, target.as_deref()),

        Commands::List { state, batch, format } => cmd_list(cfg, state.as_deref(), batch.as_deref(), format),

        Commands::Transition { id, state, error, pr_url } => {
            let store = open_store(cfg)?;
            let Some(to) = TaskState::parse(state) else {
                bail!("unknown state {state}; valid: {}", state_names().join(", "));
            };
            let fields = Fields {
                error: error.clone(),
                pr_url: pr_url.clone(),
                ..Fields::default()
            };
            machine::force_transition(&store, id, to, "operator transition", fields)?;
            println!("[{id}] → {to}");
            Ok(0)
        }

        Commands::Reset { id } => {
            let store = open_store(cfg)?;
            machine::reset(&store, id)?;
            println!("[{id}] reset to queued");
            Ok(0)
        }

        Commands::Cancel { target } => cmd_cancel(cfg, target),

        Commands::Pause { batch } => cmd_set_batch_status(cfg, batch, BatchStatus::Paused),

        Commands::Resume { batch } => cmd_set_batch_status(cfg, batch, BatchStatus::Active),

        Commands::Cleanup { dry_run } => {
            let store = open_store(cfg)?;
            let notes = hygiene::cleanup(&store, cfg, *dry_run)?;
            for note in &notes {
                println!("{}{note}", if *dry_run { "[dry-run] " } else { "" });
            }
            println!("{} item(s)", notes.len());
            Ok(0)
        }

        Commands::KillWorkers { dry_run } => {
            let store = open_store(cfg)?;
            let orphans = hygiene::emergency_kill(&store, cfg, *dry_run)?;
            for pid in &orphans {
                println!("{}killed orphan worker pid {pid}", if *dry_run { "[dry-run] would have " } else { "" });
            }
            println!("{} orphan(s)", orphans.len());
            Ok(0)
        }

        Commands::PrCheck { id } => cmd_lifecycle_step(cfg, id, Some(TaskState::PrReview)),
        Commands::PrMerge { id } => cmd_lifecycle_step(cfg, id, Some(TaskState::Merging)),
        Commands::PrLifecycle { id } => cmd_lifecycle_step(cfg, id, None),

        Commands::Verify { id } => {
            let store = open_store(cfg)?;
            let task = store
                .find_task(id)?
                .with_context(|| format!("unknown task {id}"))?;
            if task.status != TaskState::Deployed && task.status != TaskState::VerifyFailed {
                bail!("[{id}] verify needs a deployed or verify_failed task (is {})", task.status);
            }
            // Re-running after verify_failed goes back through verifying.
            if task.status == TaskState::VerifyFailed {
                machine::transition(&store, id, TaskState::Verifying, "re-verification", Fields::default())?;
                let task = store
                    .find_task(id)?
                    .with_context(|| format!("task {id} vanished mid-verify"))?;
                let repo = Path::new(&task.repo);
                let report = supervisor_core::verify::verify_task(repo, id, "supervisor")?;
                let to = if report.all_passed { TaskState::Verified } else { TaskState::VerifyFailed };
                machine::transition(&store, id, to, "re-verification", Fields::default())?;
                println!("[{id}] {to}");
            } else {
                let note = lifecycle::run_verification(&store, &task)?;
                println!("{note}");
            }
            Ok(0)
        }

        Commands::Cron { subcommand } => match subcommand {
            CronCommands::Install { interval } => cron::install(cfg, *interval),
            CronCommands::Uninstall => cron::uninstall(),
            CronCommands::Status => cron::status(),
        },

        Commands::Watch { repo } => {
            watch::run(cfg, repo.as_deref())?;
            Ok(0)
        }

        Commands::SelfHeal { id } => {
            let store = open_store(cfg)?;
            let task = store
                .find_task(id)?
                .with_context(|| format!("unknown task {id}"))?;
            match heal::create_diagnostic(&store, cfg, &task)? {
                Some(diag_id) => {
                    println!("[{id}] created diagnostic {diag_id}");
                    Ok(0)
                }
                None => {
                    eprintln!("[{id}] not eligible for self-heal");
                    Ok(1)
                }
            }
        }

        Commands::Doctor => cmd_doctor(cfg),

        Commands::Db { sql } => {
            let store = open_store(cfg)?;
            match sql {
                None => println!("{}", cfg.db_path().display()),
                Some(sql) => {
                    for row in store.exec_sql(sql)? {
                        println!("{}", row.join("\t"));
                    }
                }
            }
            Ok(0)
        }
    }
}

fn state_names() -> Vec<&'static str> {
    ALL_STATES.iter().map(|s| s.as_str()).collect()
}

// ── Command bodies ────────────────────────────────────────────────────────────

fn cmd_add(
    cfg: &Config,
    id: &str,
    repo: Option<&str>,
    description: &str,
    model: Option<&str>,
    max_retries: u32,
    with_issue: bool,
) -> Result<i32> {
    let store = open_store(cfg)?;
    let repo = match repo {
        Some(r) => std::fs::canonicalize(r)
            .with_context(|| format!("repo path {r}"))?
            .display()
            .to_string(),
        None => std::env::current_dir()?.display().to_string(),
    };
    let model = model.unwrap_or(&cfg.default_model);
    let task = store.insert_task(id, &repo, description, model, max_retries)?;
    println!("[{}] queued ({})", task.id, task.repo);

    if with_issue || cfg.auto_issue {
        // Best-effort tracker issue; a missing remote just logs a warning.
        let ok = std::process::Command::new("gh")
            .current_dir(&repo)
            .args(["issue", "create", "--title", &format!("{id}: {description}"), "--body", description, "--label", "supervisor"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            eprintln!("[{id}] warning: could not create tracker issue");
        }
    }
    Ok(0)
}

fn cmd_batch(
    cfg: &Config,
    name: &str,
    concurrency: u32,
    max_load: u32,
    tasks: &[String],
    release_on_complete: bool,
    release_type: &str,
) -> Result<i32> {
    let store = open_store(cfg)?;
    let Some(release_type) = ReleaseType::parse(release_type) else {
        bail!("unknown release type {release_type}; valid: major, minor, patch");
    };
    let batch = store.insert_batch(name, concurrency, max_load, release_on_complete, release_type)?;
    for task_id in tasks {
        store
            .find_task(task_id)?
            .with_context(|| format!("unknown task {task_id}"))?;
        store.add_task_to_batch(batch.id, task_id)?;
    }
    println!("batch {} created with {} task(s)", batch.name, tasks.len());
    Ok(0)
}

fn cmd_dispatch(cfg: &Config, id: &str, batch_name: Option<&str>) -> Result<i32> {
    let store = open_store(cfg)?;
    let batch = match batch_name {
        Some(name) => Some(
            store
                .find_batch(name)?
                .with_context(|| format!("unknown batch {name}"))?,
        ),
        None => store.batches_for_task(id)?.into_iter().next(),
    };
    let dispatcher = Dispatcher::new(&store, cfg);
    let mut health = HealthProbe::new(cfg.health_dir());
    match dispatcher.dispatch(id, batch.as_ref(), &mut health)? {
        DispatchOutcome::Dispatched { pid } => {
            println!("[{id}] dispatched (pid {pid})");
            Ok(0)
        }
        DispatchOutcome::ConcurrencyLimited => {
            eprintln!("[{id}] concurrency limited");
            Ok(2)
        }
        DispatchOutcome::ProviderUnavailable => {
            eprintln!("[{id}] provider unavailable");
            Ok(3)
        }
        DispatchOutcome::NotDispatchable(reason) => {
            eprintln!("[{id}] not dispatchable: {reason}");
            Ok(1)
        }
        DispatchOutcome::Failed(reason) => {
            eprintln!("[{id}] dispatch failed: {reason}");
            Ok(1)
        }
        DispatchOutcome::BlockedMaxRetries => {
            eprintln!("[{id}] retries exhausted");
            Ok(1)
        }
    }
}

fn cmd_evaluate(cfg: &Config, id: &str, no_ai: bool) -> Result<i32> {
    let store = open_store(cfg)?;
    let task = store
        .find_task(id)?
        .with_context(|| format!("unknown task {id}"))?;

    // Pull a finished worker into evaluating first.
    if task.status == TaskState::Running {
        machine::transition(&store, id, TaskState::Evaluating, "manual evaluate", Fields::default())?;
    } else if task.status != TaskState::Evaluating {
        bail!("[{id}] evaluate needs a running or evaluating task (is {})", task.status);
    }
    let task = store
        .find_task(id)?
        .with_context(|| format!("task {id} vanished mid-evaluate"))?;

    let git = task
        .worktree
        .as_deref()
        .and_then(|wt| supervisor_core::gitops::gather_evidence(Path::new(&task.repo), Path::new(wt)));
    let ai = CliVerdictClient {
        cli: cfg.eval_cli.clone(),
        model: cfg.eval_model.clone(),
    };
    let ai_ref: Option<&dyn VerdictClient> = if no_ai { None } else { Some(&ai) };
    let log_path = task.log_file.clone().unwrap_or_default();
    let evaluation = evaluate::evaluate_task(
        Path::new(&log_path),
        &task.description,
        task.retries,
        task.max_retries,
        git,
        ai_ref,
    )?;
    if let Some(line) = &evaluation.ai_verdict_line {
        store.append_state_log(id, "evaluating", "evaluating", &format!("AI eval verdict: {line}"))?;
    }
    println!("[{id}] verdict: {}", evaluation.verdict.as_wire());
    let mut summary = PulseSummary::default();
    pulse::apply_verdict(&store, cfg, &task, &evaluation.verdict, &mut summary)?;
    Ok(0)
}

fn cmd_pulse(cfg: &Config, batch: Option<&str>, resume: Option<&str>) -> Result<i32> {
    let store = open_store(cfg)?;
    let resume_point = match resume {
        Some(p) => pulse::read_resume(Path::new(p)),
        None => pulse::read_resume(&cfg.resume_path()),
    };
    let (batch_filter, start_phase) = match &resume_point {
        Some(point) => (point.batch_filter.as_deref().or(batch), point.phase),
        None => (batch, 1),
    };

    let (summary, respawn) = pulse::run(&store, cfg, batch_filter, start_phase)?;
    eprintln!("{}", summary.render());

    if respawn.is_some() {
        // Memory ceiling hit: exec a fresh pulse with the resume pointer.
        use std::os::unix::process::CommandExt;
        let exe = std::env::current_exe()?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("pulse")
            .arg("--resume")
            .arg(cfg.resume_path());
        let err = cmd.exec();
        eprintln!("supervisor: respawn failed: {err}");
        return Ok(1);
    }
    Ok(0)
}

fn cmd_status(cfg: &Config, target: Option<&str>) -> Result<i32> {
    let store = open_store(cfg)?;
    match target {
        None => {
            println!(
                "supervisor @ {} — {}",
                cfg.data_dir.display(),
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%SZ")
            );
            let tasks = store.list_tasks(&TaskFilter::default())?;
            let mut counts: Vec<(TaskState, usize)> = Vec::new();
            for state in ALL_STATES {
                let n = tasks.iter().filter(|t| t.status == state).count();
                if n > 0 {
                    counts.push((state, n));
                }
            }
            if counts.is_empty() {
                println!("no tasks");
            }
            for (state, n) in counts {
                println!("  {:<14} {n}", state.as_str());
            }
            for batch in store.list_batches(None)? {
                let members = store.batch_tasks(batch.id)?;
                println!(
                    "  batch {:<20} {} ({} task(s), concurrency {})",
                    batch.name, batch.status, members.len(), batch.concurrency
                );
            }
        }
        Some(target) => {
            if let Some(task) = store.find_task(target)? {
                println!("{} {} — {}", task.status.icon(), task.id, task.status);
                println!("  repo:     {}", task.repo);
                if !task.description.is_empty() {
                    println!("  desc:     {}", task.description);
                }
                println!("  model:    {}", task.model);
                println!("  retries:  {}/{}", task.retries, task.max_retries);
                for (label, value) in [
                    ("session", &task.session_id),
                    ("worktree", &task.worktree),
                    ("branch", &task.branch),
                    ("log", &task.log_file),
                    ("pr", &task.pr_url),
                    ("error", &task.error),
                ] {
                    if let Some(v) = value {
                        println!("  {:<10}{v}", format!("{label}:"));
                    }
                }
                println!("  created:  {}", task.created_at);
                if let Some(ts) = &task.completed_at {
                    println!("  finished: {ts}");
                }
                println!("  history:");
                for entry in store.state_log(target)? {
                    let from = if entry.from_state.is_empty() { "∅" } else { &entry.from_state };
                    println!("    {} {from} → {} ({})", entry.created_at, entry.to_state, entry.reason);
                }
            } else if let Some(batch) = store.find_batch(target)? {
                println!("batch {} — {}", batch.name, batch.status);
                for task in store.batch_tasks(batch.id)? {
                    println!("  {} {:<8} {}", task.status.icon(), task.id, task.status);
                }
            } else {
                bail!("no task or batch named {target}");
            }
        }
    }
    Ok(0)
}

fn cmd_list(cfg: &Config, state: Option<&str>, batch: Option<&str>, format: &str) -> Result<i32> {
    let store = open_store(cfg)?;
    let statuses = match state {
        Some(s) => {
            let Some(parsed) = TaskState::parse(s) else {
                bail!("unknown state {s}; valid: {}", state_names().join(", "));
            };
            vec![parsed]
        }
        None => vec![],
    };
    let filter = TaskFilter {
        statuses,
        batch: batch.map(str::to_string),
        ..TaskFilter::default()
    };
    let tasks = store.list_tasks(&filter)?;

    if format == "json" {
        let items: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "repo": t.repo,
                    "status": t.status.as_str(),
                    "model": t.model,
                    "retries": t.retries,
                    "max_retries": t.max_retries,
                    "pr_url": t.pr_url,
                    "error": t.error,
                    "updated_at": t.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for task in &tasks {
            println!(
                "{} {:<10} {:<14} {}",
                task.status.icon(),
                task.id,
                task.status.as_str(),
                task.pr_url.as_deref().unwrap_or("")
            );
        }
        println!("{} task(s)", tasks.len());
    }
    Ok(0)
}

fn cmd_cancel(cfg: &Config, target: &str) -> Result<i32> {
    let store = open_store(cfg)?;
    if let Some(task) = store.find_task(target)? {
        if task.status.is_terminal_for_batch() {
            println!("[{target}] already terminal ({})", task.status);
            return Ok(0);
        }
        // Running workers are not killed here; the next worker-check sweep
        // sees the terminal state and performs descendant-kill.
        if machine::transition(&store, target, TaskState::Cancelled, "cancelled by operator", Fields::default()).is_err() {
            machine::force_transition(&store, target, TaskState::Cancelled, "cancelled by operator", Fields::default())?;
        }
        println!("[{target}] cancelled");
        return Ok(0);
    }
    if let Some(batch) = store.find_batch(target)? {
        store.set_batch_status(batch.id, BatchStatus::Cancelled)?;
        let mut n = 0;
        for task in store.batch_tasks(batch.id)? {
            if !task.status.is_terminal_for_batch() {
                if machine::transition(&store, &task.id, TaskState::Cancelled, "batch cancelled", Fields::default()).is_err() {
                    machine::force_transition(&store, &task.id, TaskState::Cancelled, "batch cancelled", Fields::default())?;
                }
                n += 1;
            }
        }
        println!("batch {} cancelled ({n} task(s))", batch.name);
        return Ok(0);
    }
    bail!("no task or batch named {target}");
}

fn cmd_set_batch_status(cfg: &Config, name: &str, status: BatchStatus) -> Result<i32> {
    let store = open_store(cfg)?;
    let batch = store
        .find_batch(name)?
        .with_context(|| format!("unknown batch {name}"))?;
    store.set_batch_status(batch.id, status)?;
    println!("batch {} → {status}", batch.name);
    Ok(0)
}

fn cmd_lifecycle_step(cfg: &Config, id: &str, required: Option<TaskState>) -> Result<i32> {
    let store = open_store(cfg)?;
    let task = store
        .find_task(id)?
        .with_context(|| format!("unknown task {id}"))?;
    if let Some(required) = required {
        if task.status != required {
            bail!("[{id}] needs a task in {required} (is {})", task.status);
        }
    }
    let note = lifecycle::advance(&store, cfg, &GhCli, &task)?;
    println!("{note}");
    Ok(0)
}

fn cmd_doctor(cfg: &Config) -> Result<i32> {
    let mut problems = 0;

    let check = |ok: bool, what: &str, fix: &str| {
        if ok {
            println!("  ok    {what}");
            0
        } else {
            println!("  FAIL  {what}\n        fix: {fix}");
            1
        }
    };

    println!("supervisor doctor");
    problems += check(
        which("git"),
        "git on PATH",
        "install git",
    );
    problems += check(
        which("gh"),
        "gh on PATH",
        "install the GitHub CLI",
    );
    let gh_auth = std::process::Command::new("gh")
        .args(["auth", "status"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    problems += check(gh_auth, "gh authenticated", "run `gh auth login`");
    problems += check(
        which(&cfg.worker_cli),
        &format!("worker CLI `{}` on PATH", cfg.worker_cli),
        "install it or set SUPERVISOR_WORKER_CLI",
    );
    let writable = std::fs::create_dir_all(&cfg.data_dir)
        .and_then(|_| std::fs::write(cfg.data_dir.join(".doctor-probe"), "ok"))
        .is_ok();
    let _ = std::fs::remove_file(cfg.data_dir.join(".doctor-probe"));
    problems += check(
        writable,
        &format!("data dir {} writable", cfg.data_dir.display()),
        "set AIDEVOPS_SUPERVISOR_DIR to a writable path",
    );

    if problems == 0 {
        println!("all checks passed");
        Ok(0)
    } else {
        println!("{problems} problem(s)");
        Ok(1)
    }
}

fn which(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
