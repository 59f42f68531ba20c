//! GitHub operations via the `gh` CLI.
//!
//! Subprocess adapter so the supervisor has no GitHub API crate dependency
//! and inherits the operator's existing `gh auth` session. All decision
//! logic lives behind [`GitHubGateway`] so the lifecycle handler is testable
//! with mocks; parsing of `gh --json` output is pure.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Stdio};

/// PR state on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// Aggregate CI outcome from the status-check rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksOutcome {
    /// Every completed check succeeded (or there are no checks).
    Passing,
    /// At least one check failed or errored.
    Failing,
    /// At least one check still queued or running, none failed.
    Pending,
}

/// Remote review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
    /// No reviewers assigned / no reviews submitted.
    None,
}

/// Snapshot of a PR, as needed by the pr_review stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrStatus {
    pub state: PrState,
    pub is_draft: bool,
    pub checks: ChecksOutcome,
    pub review_decision: ReviewDecision,
}

/// One unresolved review thread (first comment body carries the ask).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewThread {
    pub body: String,
}

/// Port for remote PR operations.
pub trait GitHubGateway {
    /// Current status of a PR by URL.
    fn pr_status(&self, repo: &Path, pr_url: &str) -> Result<PrStatus>;

    /// Unresolved review threads of a PR.
    fn unresolved_threads(&self, repo: &Path, pr_url: &str) -> Result<Vec<ReviewThread>>;

    /// Squash-merge a PR. The head branch survives; deploy cleans it up.
    fn merge_pr(&self, repo: &Path, pr_url: &str) -> Result<()>;

    /// Does the remote show this PR as merged?
    fn pr_is_merged(&self, repo: &Path, pr_url: &str) -> Result<bool>;

    /// URL of an open-or-merged PR whose head is `branch`, if any.
    fn find_pr_for_branch(&self, repo: &Path, branch: &str) -> Result<Option<String>>;
}

/// Concrete adapter calling the `gh` CLI inside the repo directory.
pub struct GhCli;

impl GhCli {
    fn gh_output(repo: &Path, args: &[&str]) -> Result<String> {
        let out = Command::new("gh")
            .current_dir(repo)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("failed to run: gh {}", args.join(" ")))?;
        if !out.status.success() {
            bail!("gh {} failed", args.join(" "));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn gh_status(repo: &Path, args: &[&str]) -> bool {
        Command::new("gh")
            .current_dir(repo)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl GitHubGateway for GhCli {
    fn pr_status(&self, repo: &Path, pr_url: &str) -> Result<PrStatus> {
        let out = Self::gh_output(
            repo,
            &[
                "pr",
                "view",
                pr_url,
                "--json",
                "state,isDraft,statusCheckRollup,reviewDecision",
            ],
        )?;
        parse_pr_status(&out)
    }

    fn unresolved_threads(&self, repo: &Path, pr_url: &str) -> Result<Vec<ReviewThread>> {
        let (owner, name, number) =
            split_pr_url(pr_url).context("unrecognised PR URL for thread query")?;
        let query = "query($owner:String!,$name:String!,$number:Int!){\
                     repository(owner:$owner,name:$name){pullRequest(number:$number){\
                     reviewThreads(first:100){nodes{isResolved comments(first:1){nodes{body}}}}}}}";
        let out = Self::gh_output(
            repo,
            &[
                "api",
                "graphql",
                "-f",
                &format!("query={query}"),
                "-F",
                &format!("owner={owner}"),
                "-F",
                &format!("name={name}"),
                "-F",
                &format!("number={number}"),
            ],
        )?;
        parse_review_threads(&out)
    }

    fn merge_pr(&self, repo: &Path, pr_url: &str) -> Result<()> {
        if Self::gh_status(repo, &["pr", "merge", pr_url, "--squash"]) {
            Ok(())
        } else {
            bail!("gh pr merge --squash failed for {pr_url}")
        }
    }

    fn pr_is_merged(&self, repo: &Path, pr_url: &str) -> Result<bool> {
        let out = Self::gh_output(repo, &["pr", "view", pr_url, "--json", "state", "-q", ".state"])?;
        Ok(out == "MERGED")
    }

    fn find_pr_for_branch(&self, repo: &Path, branch: &str) -> Result<Option<String>> {
        let out = Self::gh_output(
            repo,
            &[
                "pr",
                "list",
                "--head",
                branch,
                "--state",
                "all",
                "--json",
                "url,state",
                "-q",
                r#"[.[] | select(.state == "OPEN" or .state == "MERGED")][0].url"#,
            ],
        )?;
        if out.is_empty() || out == "null" {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

/// `https://github.com/o/r/pull/42` → `("o", "r", 42)`.
pub fn split_pr_url(url: &str) -> Option<(String, String, u64)> {
    let rest = url.strip_prefix("https://github.com/")?;
    let mut parts = rest.split('/');
    let owner = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    if parts.next()? != "pull" {
        return None;
    }
    let number = parts.next()?.parse().ok()?;
    Some((owner, name, number))
}

/// Parse `gh pr view --json state,isDraft,statusCheckRollup,reviewDecision`.
pub fn parse_pr_status(json: &str) -> Result<PrStatus> {
    let v: Value = serde_json::from_str(json).context("parsing gh pr view output")?;

    let state = match v["state"].as_str() {
        Some("MERGED") => PrState::Merged,
        Some("CLOSED") => PrState::Closed,
        _ => PrState::Open,
    };

    let review_decision = match v["reviewDecision"].as_str() {
        Some("APPROVED") => ReviewDecision::Approved,
        Some("CHANGES_REQUESTED") => ReviewDecision::ChangesRequested,
        Some("REVIEW_REQUIRED") => ReviewDecision::ReviewRequired,
        _ => ReviewDecision::None,
    };

    Ok(PrStatus {
        state,
        is_draft: v["isDraft"].as_bool().unwrap_or(false),
        checks: rollup_outcome(&v["statusCheckRollup"]),
        review_decision,
    })
}

/// Fold the status-check rollup into one outcome. Check runs carry
/// `status`/`conclusion`; commit statuses carry `state`.
fn rollup_outcome(rollup: &Value) -> ChecksOutcome {
    let Some(items) = rollup.as_array() else {
        return ChecksOutcome::Passing;
    };
    let mut pending = false;
    for item in items {
        let conclusion = item["conclusion"].as_str().unwrap_or("");
        let status = item["status"].as_str().unwrap_or("");
        let state = item["state"].as_str().unwrap_or("");
        if matches!(conclusion, "FAILURE" | "ERROR") || matches!(state, "FAILURE" | "ERROR") {
            return ChecksOutcome::Failing;
        }
        if matches!(status, "IN_PROGRESS" | "QUEUED" | "PENDING") || state == "PENDING" {
            pending = true;
        }
    }
    if pending {
        ChecksOutcome::Pending
    } else {
        ChecksOutcome::Passing
    }
}

/// Parse the graphql reviewThreads response, keeping unresolved threads.
pub fn parse_review_threads(json: &str) -> Result<Vec<ReviewThread>> {
    let v: Value = serde_json::from_str(json).context("parsing reviewThreads response")?;
    let nodes = &v["data"]["repository"]["pullRequest"]["reviewThreads"]["nodes"];
    let mut threads = Vec::new();
    if let Some(items) = nodes.as_array() {
        for item in items {
            if item["isResolved"].as_bool() == Some(true) {
                continue;
            }
            let body = item["comments"]["nodes"][0]["body"]
                .as_str()
                .unwrap_or("")
                .to_string();
            threads.push(ReviewThread { body });
        }
    }
    Ok(threads)
}
