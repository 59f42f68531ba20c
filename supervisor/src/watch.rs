//! File-watch-driven pulse.
//!
//! Watches each known repo's TODO.md (or one repo with `--repo`) and fires
//! a pulse when something changes, debounced so a burst of editor writes
//! triggers one cycle. A periodic fallback pulse still runs so PR states
//! advance even when no file changes.

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use supervisor_core::config::Config;
use supervisor_core::pulse;
use supervisor_core::store::{Store, TaskFilter};

/// Fallback pulse interval when no file events arrive.
const IDLE_PULSE: Duration = Duration::from_secs(300);

/// Quiet window after a file event before the pulse fires.
const DEBOUNCE: Duration = Duration::from_secs(2);

pub fn run(cfg: &Config, repo: Option<&str>) -> Result<()> {
    let store = Store::open(&cfg.db_path())?;
    let watch_dirs = match repo {
        Some(r) => vec![PathBuf::from(r)],
        None => {
            let mut repos: Vec<PathBuf> = store
                .list_tasks(&TaskFilter::default())?
                .into_iter()
                .map(|t| PathBuf::from(t.repo))
                .collect();
            repos.sort();
            repos.dedup();
            repos
        }
    };

    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            // Only TODO.md edits matter; everything else is worker noise.
            if event.paths.iter().any(|p| p.file_name().is_some_and(|n| n == "TODO.md")) {
                let _ = tx.send(());
            }
        }
    })
    .context("creating file watcher")?;

    for dir in &watch_dirs {
        if dir.exists() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("watching {}", dir.display()))?;
            println!("watching {}", dir.display());
        }
    }
    if watch_dirs.is_empty() {
        println!("no repos known yet; running on the idle interval only");
    }

    loop {
        match rx.recv_timeout(IDLE_PULSE) {
            Ok(()) => {
                // Debounce: swallow the burst, then pulse once.
                while rx.recv_timeout(DEBOUNCE).is_ok() {}
                run_one_pulse(&store, cfg);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => run_one_pulse(&store, cfg),
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn run_one_pulse(store: &Store, cfg: &Config) {
    match pulse::run(store, cfg, None, 1) {
        Ok((summary, respawn)) => {
            eprintln!("{}", summary.render());
            if respawn.is_some() {
                // In watch mode the loop itself is the long-lived process;
                // exec a fresh copy of ourselves to shed memory.
                use std::os::unix::process::CommandExt;
                if let Ok(exe) = std::env::current_exe() {
                    let err = std::process::Command::new(exe).arg("watch").exec();
                    eprintln!("watch: respawn failed: {err}");
                }
            }
        }
        Err(e) => eprintln!("watch: pulse failed: {e:#}"),
    }
}
