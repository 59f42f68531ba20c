//! Memory collaborator — best-effort context recall for workers.
//!
//! Each repo accumulates a lessons file under `<data dir>/memory/`. On
//! dispatch the tail of that file is injected as a short preamble; on
//! terminal failure a one-line lesson is appended. Everything here is
//! best-effort: a missing or unreadable memory never blocks a dispatch.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::task::utc_now;

/// Most lessons a recall preamble carries.
const RECALL_LINES: usize = 20;

pub fn repo_slug(repo: &str) -> String {
    repo.trim_matches('/').replace('/', "--")
}

fn memory_file(memory_dir: &Path, repo: &str) -> PathBuf {
    memory_dir.join(format!("{}.md", repo_slug(repo)))
}

/// Short textual preamble of past lessons for this repo. Empty string when
/// no memory exists.
pub fn recall(memory_dir: &Path, repo: &str) -> String {
    let Ok(content) = std::fs::read_to_string(memory_file(memory_dir, repo)) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(RECALL_LINES);
    format!(
        "Lessons from earlier work in this repository:\n{}\n",
        lines[start..].join("\n")
    )
}

/// Append a one-line lesson for a task outcome. Silently ignores I/O errors.
pub fn record_lesson(memory_dir: &Path, repo: &str, task_id: &str, lesson: &str) {
    if std::fs::create_dir_all(memory_dir).is_err() {
        return;
    }
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(memory_file(memory_dir, repo))
    {
        let _ = writeln!(file, "- {} {task_id}: {lesson}", utc_now());
    }
}
