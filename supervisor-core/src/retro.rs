//! Batch retrospectives and release triggers.
//!
//! When a batch completes, pulse phase 8 writes a retrospective artifact
//! summarising every member task, and — when the batch asked for it — drops
//! a release trigger file for the release tooling to pick up.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;

use crate::config::Config;
use crate::store::Store;
use crate::task::{utc_now, Batch, TaskState};

/// Write `retros/<batch>-<stamp>.md`. Returns the artifact path.
pub fn write_retrospective(store: &Store, cfg: &Config, batch: &Batch) -> Result<PathBuf> {
    let members = store.batch_tasks(batch.id)?;
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let dir = cfg.retros_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}-{stamp}.md", batch.name));

    let mut doc = format!(
        "# Retrospective: {}\n\nCompleted {} with {} task(s).\n\n\
         | Task | Outcome | Retries | PR |\n|---|---|---|---|\n",
        batch.name,
        utc_now(),
        members.len(),
    );
    for task in &members {
        doc.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            task.id,
            task.status,
            task.retries,
            task.pr_url.as_deref().unwrap_or("—"),
        ));
    }

    let troubled: Vec<&str> = members
        .iter()
        .filter(|t| {
            t.retries > 0 || matches!(t.status, TaskState::Failed | TaskState::Cancelled)
        })
        .map(|t| t.id.as_str())
        .collect();
    if !troubled.is_empty() {
        doc.push_str(&format!(
            "\nNeeded attention: {}. Audit trail in `state_log`.\n",
            troubled.join(", ")
        ));
    }

    std::fs::write(&path, doc).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Enqueue a release trigger for a completed batch, if configured.
pub fn enqueue_release(cfg: &Config, batch: &Batch) -> Result<Option<PathBuf>> {
    if !batch.release_on_complete {
        return Ok(None);
    }
    let dir = cfg.releases_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", batch.name));
    let trigger = json!({
        "batch": batch.name,
        "release_type": batch.release_type.as_str(),
        "created_at": utc_now(),
    });
    std::fs::write(&path, serde_json::to_string_pretty(&trigger)?)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{transition, Fields};
    use crate::task::ReleaseType;
    use tempfile::TempDir;

    fn setup(release: bool) -> (TempDir, Store, Config, Batch) {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load_with_env(|k| {
            (k == "AIDEVOPS_SUPERVISOR_DIR").then(|| dir.path().display().to_string())
        })
        .unwrap();
        let store = Store::open_in_memory().unwrap();
        let batch = store
            .insert_batch("sprint-1", 4, 2, release, ReleaseType::Minor)
            .unwrap();
        store.insert_task("t1", "/r", "", "coding", 3).unwrap();
        store.add_task_to_batch(batch.id, "t1").unwrap();
        for to in [
            TaskState::Dispatched,
            TaskState::Running,
            TaskState::Evaluating,
            TaskState::Retrying,
            TaskState::Dispatched,
            TaskState::Running,
            TaskState::Evaluating,
            TaskState::Complete,
        ] {
            transition(&store, "t1", to, "test", Fields::pr_url("https://github.com/o/r/pull/5")).unwrap();
        }
        (dir, store, cfg, batch)
    }

    #[test]
    fn retrospective_lists_members_and_retries() {
        let (_dir, store, cfg, batch) = setup(false);
        let path = write_retrospective(&store, &cfg, &batch).unwrap();
        let doc = std::fs::read_to_string(path).unwrap();
        assert!(doc.contains("# Retrospective: sprint-1"));
        assert!(doc.contains("| t1 | complete | 1 |"));
        assert!(doc.contains("Needed attention: t1"));
    }

    #[test]
    fn release_trigger_written_only_when_configured() {
        let (_dir, _store, cfg, batch) = setup(false);
        assert!(enqueue_release(&cfg, &batch).unwrap().is_none());

        let (_dir, _store, cfg, batch) = setup(true);
        let path = enqueue_release(&cfg, &batch).unwrap().unwrap();
        let trigger: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(trigger["batch"], "sprint-1");
        assert_eq!(trigger["release_type"], "minor");
    }
}
