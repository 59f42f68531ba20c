//! Git operations via the `git` CLI.
//!
//! Subprocess adapter in the same shape as the GitHub gateway: the
//! supervisor has no dependency on a git library and inherits the
//! operator's existing git configuration.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::evaluate::GitEvidence;

/// Run a `git -C <dir>` command and capture trimmed stdout.
pub fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("failed to run: git {}", args.join(" ")))?;
    if !out.status.success() {
        bail!("git {} failed in {}", args.join(" "), dir.display());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run a `git -C <dir>` command; true on success.
pub fn git_status(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// The repository's default branch: `origin/HEAD` when set, else whichever
/// of `main`/`master` exists.
pub fn default_branch(repo: &Path) -> String {
    if let Ok(r) = git_output(repo, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = r.rsplit('/').next() {
            return branch.to_string();
        }
    }
    for candidate in ["main", "master"] {
        if git_status(repo, &["rev-parse", "--verify", "--quiet", candidate]) {
            return candidate.to_string();
        }
    }
    "main".to_string()
}

/// Deterministic worktree location: `<repoParent>/<repoName>.feature-<taskId>`.
pub fn worktree_path(repo: &Path, task_id: &str) -> PathBuf {
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let parent = repo.parent().unwrap_or(Path::new("."));
    parent.join(format!("{name}.feature-{task_id}"))
}

/// Create (or reuse) the task's isolated worktree on `feature/<taskId>`,
/// branched from the repo's default branch.
pub fn ensure_worktree(repo: &Path, task_id: &str) -> Result<PathBuf> {
    let path = worktree_path(repo, task_id);
    if path.exists() {
        return Ok(path);
    }
    let branch = format!("feature/{task_id}");
    let base = default_branch(repo);
    let path_str = path.to_string_lossy().to_string();

    // A branch left over from an earlier attempt is reused; otherwise the
    // worktree gets a fresh branch off the base.
    let created = if git_status(repo, &["rev-parse", "--verify", "--quiet", &branch]) {
        git_status(repo, &["worktree", "add", &path_str, &branch])
    } else {
        git_status(repo, &["worktree", "add", "-b", &branch, &path_str, &base])
    };
    if created {
        return Ok(path);
    }

    // Stale worktree registrations are the usual culprit; prune and retry once.
    let _ = git_status(repo, &["worktree", "prune"]);
    let retried = if git_status(repo, &["rev-parse", "--verify", "--quiet", &branch]) {
        git_status(repo, &["worktree", "add", &path_str, &branch])
    } else {
        git_status(repo, &["worktree", "add", "-b", &branch, &path_str, &base])
    };
    if retried {
        Ok(path)
    } else {
        bail!("worktree creation failed for {task_id} at {}", path.display());
    }
}

/// Remove a task worktree and prune the registration. Best-effort.
pub fn remove_worktree(repo: &Path, worktree: &Path) {
    let wt = worktree.to_string_lossy().to_string();
    if !git_status(repo, &["worktree", "remove", "--force", &wt]) && worktree.exists() {
        let _ = std::fs::remove_dir_all(worktree);
    }
    let _ = git_status(repo, &["worktree", "prune"]);
}

/// Commits on HEAD not on `base`, counted inside the worktree.
pub fn commits_ahead(worktree: &Path, base: &str) -> Result<u32> {
    let out = git_output(worktree, &["rev-list", "--count", &format!("{base}..HEAD")])?;
    out.parse().context("parsing rev-list count")
}

/// Any uncommitted changes (staged, unstaged, or untracked)?
pub fn has_uncommitted(worktree: &Path) -> Result<bool> {
    let out = git_output(worktree, &["status", "--porcelain"])?;
    Ok(!out.is_empty())
}

/// Gather tier-2.5 evidence from a task worktree. Read-only; the
/// supervisor never writes into worker worktrees.
pub fn gather_evidence(repo: &Path, worktree: &Path) -> Option<GitEvidence> {
    if !worktree.exists() {
        return None;
    }
    let base = default_branch(repo);
    Some(GitEvidence {
        commits_ahead: commits_ahead(worktree, &base).unwrap_or(0),
        uncommitted: has_uncommitted(worktree).unwrap_or(false),
    })
}

/// Fast-forward the default branch after a merge. True on success.
pub fn pull_ff_only(repo: &Path) -> bool {
    git_status(repo, &["pull", "--ff-only"])
}

/// Push a branch to origin from its worktree. True on success.
pub fn push_branch(worktree: &Path, branch: &str) -> bool {
    git_status(worktree, &["push", "-u", "origin", branch])
}

/// Delete a branch on the remote. Best-effort.
pub fn delete_remote_branch(repo: &Path, branch: &str) {
    let _ = git_status(repo, &["push", "origin", "--delete", branch]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Init a repo with one commit on `main`.
    fn init_repo(dir: &Path) -> PathBuf {
        let repo = dir.join("demo");
        fs::create_dir(&repo).unwrap();
        assert!(git_status(&repo, &["init", "--quiet"]));
        assert!(git_status(&repo, &["checkout", "-q", "-b", "main"]));
        assert!(git_status(&repo, &["config", "user.email", "test@localhost"]));
        assert!(git_status(&repo, &["config", "user.name", "test"]));
        fs::write(repo.join("README.md"), "# demo\n").unwrap();
        assert!(git_status(&repo, &["add", "."]));
        assert!(git_status(&repo, &["commit", "-q", "-m", "init"]));
        repo
    }

    #[test]
    fn worktree_path_is_sibling_of_repo() {
        let path = worktree_path(Path::new("/repos/demo"), "t101");
        assert_eq!(path, Path::new("/repos/demo.feature-t101"));
    }

    #[test]
    fn default_branch_detected_without_origin() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        assert_eq!(default_branch(&repo), "main");
    }

    #[test]
    fn worktree_created_reused_and_removed() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());

        let wt = ensure_worktree(&repo, "t1").unwrap();
        assert!(wt.join("README.md").exists());
        assert_eq!(
            git_output(&wt, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap(),
            "feature/t1"
        );

        // Second call reuses the existing worktree.
        let again = ensure_worktree(&repo, "t1").unwrap();
        assert_eq!(wt, again);

        remove_worktree(&repo, &wt);
        assert!(!wt.exists());
    }

    #[test]
    fn worktree_recreated_after_removal_reuses_branch() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let wt = ensure_worktree(&repo, "t1").unwrap();
        remove_worktree(&repo, &wt);

        // Branch feature/t1 still exists; re-creation must not fail on -b.
        let wt2 = ensure_worktree(&repo, "t1").unwrap();
        assert!(wt2.exists());
    }

    #[test]
    fn evidence_counts_commits_and_dirt() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let wt = ensure_worktree(&repo, "t1").unwrap();

        let ev = gather_evidence(&repo, &wt).unwrap();
        assert_eq!(ev.commits_ahead, 0);
        assert!(!ev.uncommitted);

        fs::write(wt.join("new.rs"), "fn main() {}\n").unwrap();
        let ev = gather_evidence(&repo, &wt).unwrap();
        assert!(ev.uncommitted);

        assert!(git_status(&wt, &["add", "."]));
        assert!(git_status(&wt, &["commit", "-q", "-m", "work"]));
        let ev = gather_evidence(&repo, &wt).unwrap();
        assert_eq!(ev.commits_ahead, 1);
        assert!(!ev.uncommitted);
    }

    #[test]
    fn evidence_none_for_missing_worktree() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        assert!(gather_evidence(&repo, &repo.join("gone")).is_none());
    }
}
