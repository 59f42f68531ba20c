//! TODO.md contract.
//!
//! Each repo's TODO.md is both a pickup queue and a status mirror. Task
//! lines match `- [ ] tNNN …`; three markers opt a line into auto-pickup:
//! the `#auto-dispatch` tag, membership in a "dispatch queue" section, and
//! an `assignee:<identity>` token claiming the task for one supervisor.
//!
//! Every edit is made under a per-repo lock, committed as
//! `chore: mark <id> … in TODO.md`, and pushed best-effort.

use anyhow::Result;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::gitops;
use crate::memory::repo_slug;
use crate::proc::is_pid_alive;

fn task_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*- \[( |x|-)\] (t\d+(\.\d+)*)\s+(.*)$").unwrap())
}

fn dispatch_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^#{1,3}\s.*dispatch.queue.*$").unwrap())
}

fn assignee_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"assignee:(\S+)").unwrap())
}

/// One parsed TODO.md task line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoTask {
    pub id: String,
    /// `' '` open, `'x'` done, `'-'` dropped.
    pub checkbox: char,
    pub title: String,
    pub auto_dispatch_tag: bool,
    pub in_dispatch_section: bool,
    pub assignee: Option<String>,
    pub line_no: usize,
}

impl TodoTask {
    pub fn is_open(&self) -> bool {
        self.checkbox == ' '
    }
}

/// Parse all task lines, tracking dispatch-queue sections.
pub fn parse_todo(content: &str) -> Vec<TodoTask> {
    let mut tasks = Vec::new();
    let mut in_dispatch_section = false;
    for (line_no, line) in content.lines().enumerate() {
        if line.starts_with('#') {
            in_dispatch_section = dispatch_section_re().is_match(line);
            continue;
        }
        if let Some(caps) = task_line_re().captures(line) {
            let rest = caps[4].to_string();
            tasks.push(TodoTask {
                id: caps[2].to_string(),
                checkbox: caps[1].chars().next().unwrap_or(' '),
                title: rest.clone(),
                auto_dispatch_tag: rest.contains("#auto-dispatch"),
                in_dispatch_section,
                assignee: assignee_re()
                    .captures(&rest)
                    .map(|c| c[1].to_string()),
                line_no,
            });
        }
    }
    tasks
}

/// Open tasks this supervisor may pick up: marked for auto-dispatch and not
/// claimed by another identity.
pub fn pickup_candidates(tasks: &[TodoTask], identity: &str) -> Vec<TodoTask> {
    tasks
        .iter()
        .filter(|t| t.is_open())
        .filter(|t| t.auto_dispatch_tag || t.in_dispatch_section)
        .filter(|t| t.assignee.as_deref().is_none_or(|a| a == identity))
        .cloned()
        .collect()
}

/// Rewrite: `[ ] → [x]`, append `completed:<date>` and `pr:<url>`.
/// Returns None when the task line is absent or already closed.
pub fn mark_complete(content: &str, id: &str, date: &str, pr_url: Option<&str>) -> Option<String> {
    rewrite_task_line(content, id, |line| {
        let mut updated = line.replacen("- [ ]", "- [x]", 1);
        updated.push_str(&format!(" completed:{date}"));
        if let Some(url) = pr_url {
            updated.push_str(&format!(" pr:{url}"));
        }
        vec![updated]
    })
}

/// Append a `- Notes: BLOCKED: <reason>` line under the task.
pub fn mark_blocked(content: &str, id: &str, reason: &str) -> Option<String> {
    rewrite_task_line(content, id, |line| {
        let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        vec![line.to_string(), format!("{indent}  - Notes: BLOCKED: {reason}")]
    })
}

/// Add `assignee:<identity>` to an open task line. None when the line is
/// missing, closed, or already claimed by someone else.
pub fn apply_claim(content: &str, id: &str, identity: &str) -> Option<String> {
    let tasks = parse_todo(content);
    let task = tasks.iter().find(|t| t.id == id)?;
    if !task.is_open() {
        return None;
    }
    match &task.assignee {
        Some(owner) if owner != identity => None,
        Some(_) => Some(content.to_string()),
        None => rewrite_task_line(content, id, |line| {
            vec![format!("{line} assignee:{identity}")]
        }),
    }
}

fn rewrite_task_line(
    content: &str,
    id: &str,
    edit: impl FnOnce(&str) -> Vec<String>,
) -> Option<String> {
    let target = parse_todo(content)
        .into_iter()
        .find(|t| t.id == id && t.is_open())?;
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let replacement = edit(&lines[target.line_no]);
    lines.splice(target.line_no..=target.line_no, replacement);
    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

// ── Per-repo edit lock ────────────────────────────────────────────────────────

/// RAII lock guarding one repo's TODO edits. PID-stale like the pulse lock.
pub struct TodoLock {
    path: std::path::PathBuf,
}

impl TodoLock {
    pub fn acquire(locks_dir: &Path, repo: &str) -> Result<Option<Self>> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.todo.lock", repo_slug(repo)));
        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if is_pid_alive(pid) && pid != std::process::id() {
                    return Ok(None);
                }
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Some(Self { path }))
    }
}

impl Drop for TodoLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ── File + git sync ───────────────────────────────────────────────────────────

/// Status edit to mirror into TODO.md.
#[derive(Debug, Clone)]
pub enum TodoUpdate {
    Complete { date: String, pr_url: Option<String> },
    Blocked { reason: String },
}

/// Apply an update to `<repo>/TODO.md`, commit, and push. Best-effort: a
/// missing file, missing line, held lock, or failed push all return Ok with
/// `false`. Only real I/O errors propagate.
pub fn update_todo(repo_path: &Path, locks_dir: &Path, id: &str, update: &TodoUpdate) -> Result<bool> {
    let todo_path = repo_path.join("TODO.md");
    let Ok(content) = fs::read_to_string(&todo_path) else {
        return Ok(false);
    };
    let Some(_lock) = TodoLock::acquire(locks_dir, &repo_path.to_string_lossy())? else {
        return Ok(false);
    };

    let (rewritten, verb) = match update {
        TodoUpdate::Complete { date, pr_url } => (
            mark_complete(&content, id, date, pr_url.as_deref()),
            "complete",
        ),
        TodoUpdate::Blocked { reason } => (mark_blocked(&content, id, reason), "blocked"),
    };
    let Some(rewritten) = rewritten else {
        return Ok(false);
    };
    fs::write(&todo_path, rewritten)?;

    commit_and_push(repo_path, &format!("chore: mark {id} {verb} in TODO.md"));
    Ok(true)
}

/// Claim a task for this supervisor identity. Exactly one claimant's push
/// wins; the loser sees the competing claim after a rebase and backs off.
pub fn claim_task(repo_path: &Path, locks_dir: &Path, id: &str, identity: &str) -> Result<bool> {
    let todo_path = repo_path.join("TODO.md");
    let Ok(content) = fs::read_to_string(&todo_path) else {
        return Ok(false);
    };
    let Some(_lock) = TodoLock::acquire(locks_dir, &repo_path.to_string_lossy())? else {
        return Ok(false);
    };

    let Some(rewritten) = apply_claim(&content, id, identity) else {
        return Ok(false);
    };
    if rewritten == content {
        return Ok(true); // already ours
    }
    fs::write(&todo_path, rewritten)?;

    if !gitops::git_status(repo_path, &["add", "TODO.md"])
        || !gitops::git_status(
            repo_path,
            &["commit", "-q", "-m", &format!("chore: claim {id} in TODO.md")],
        )
    {
        return Ok(false);
    }
    if gitops::git_status(repo_path, &["push"]) {
        return Ok(true);
    }

    // Push lost the race. Rebase onto the winner and re-check the claim.
    if !gitops::git_status(repo_path, &["pull", "--rebase"]) {
        let _ = gitops::git_status(repo_path, &["rebase", "--abort"]);
        let _ = gitops::git_status(repo_path, &["reset", "--hard", "HEAD~1"]);
        return Ok(false);
    }
    let merged = fs::read_to_string(&todo_path).unwrap_or_default();
    let ours = parse_todo(&merged)
        .iter()
        .find(|t| t.id == id)
        .and_then(|t| t.assignee.clone())
        .is_some_and(|a| a == identity);
    if ours && gitops::git_status(repo_path, &["push"]) {
        return Ok(true);
    }
    Ok(false)
}

fn commit_and_push(repo_path: &Path, message: &str) {
    if gitops::git_status(repo_path, &["add", "TODO.md"])
        && gitops::git_status(repo_path, &["commit", "-q", "-m", message])
    {
        let _ = gitops::git_status(repo_path, &["push"]);
    }
}
