//! Task and batch entities.
//!
//! Domain model:
//!   - `TaskState`   — the 18 lifecycle labels a task moves through
//!   - `Task`        — entity persisted in the `tasks` table
//!   - `Batch`       — named task group with a concurrency budget
//!   - `StateLogEntry` — one append-only audit record per transition

use std::fmt;

/// Lifecycle state of a task.
///
/// The legal moves between states live in [`crate::machine::is_legal`] —
/// this enum is only the label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Dispatched,
    Running,
    Evaluating,
    Retrying,
    Complete,
    PrReview,
    ReviewTriage,
    Merging,
    Merged,
    Deploying,
    Deployed,
    Verifying,
    Verified,
    VerifyFailed,
    Blocked,
    Failed,
    Cancelled,
}

/// Every state, in declaration order. Used by exhaustive tests and `list --state` validation.
pub const ALL_STATES: [TaskState; 18] = [
    TaskState::Queued,
    TaskState::Dispatched,
    TaskState::Running,
    TaskState::Evaluating,
    TaskState::Retrying,
    TaskState::Complete,
    TaskState::PrReview,
    TaskState::ReviewTriage,
    TaskState::Merging,
    TaskState::Merged,
    TaskState::Deploying,
    TaskState::Deployed,
    TaskState::Verifying,
    TaskState::Verified,
    TaskState::VerifyFailed,
    TaskState::Blocked,
    TaskState::Failed,
    TaskState::Cancelled,
];

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Dispatched => "dispatched",
            TaskState::Running => "running",
            TaskState::Evaluating => "evaluating",
            TaskState::Retrying => "retrying",
            TaskState::Complete => "complete",
            TaskState::PrReview => "pr_review",
            TaskState::ReviewTriage => "review_triage",
            TaskState::Merging => "merging",
            TaskState::Merged => "merged",
            TaskState::Deploying => "deploying",
            TaskState::Deployed => "deployed",
            TaskState::Verifying => "verifying",
            TaskState::Verified => "verified",
            TaskState::VerifyFailed => "verify_failed",
            TaskState::Blocked => "blocked",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Parse a state label. Returns None for unknown labels.
    pub fn parse(s: &str) -> Option<Self> {
        ALL_STATES.iter().copied().find(|st| st.as_str() == s)
    }

    /// States that count as finished for batch-completion purposes.
    ///
    /// Note `complete` is terminal-for-batch even though the post-PR
    /// lifecycle keeps moving the task afterwards.
    pub fn is_terminal_for_batch(&self) -> bool {
        matches!(
            self,
            TaskState::Complete
                | TaskState::Deployed
                | TaskState::Merged
                | TaskState::Failed
                | TaskState::Cancelled
                | TaskState::Verified
        )
    }

    /// States in which a worker process is expected to exist.
    pub fn has_worker(&self) -> bool {
        matches!(self, TaskState::Dispatched | TaskState::Running)
    }

    /// Single-character icon for list views.
    pub fn icon(&self) -> &'static str {
        match self {
            TaskState::Queued | TaskState::Retrying => "·",
            TaskState::Dispatched
            | TaskState::Running
            | TaskState::Evaluating
            | TaskState::PrReview
            | TaskState::ReviewTriage
            | TaskState::Merging
            | TaskState::Deploying
            | TaskState::Verifying => "⧖",
            TaskState::Complete
            | TaskState::Merged
            | TaskState::Deployed
            | TaskState::Verified => "✓",
            TaskState::VerifyFailed | TaskState::Blocked | TaskState::Failed => "✗",
            TaskState::Cancelled => "−",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work driven through the lifecycle by the supervisor.
///
/// Timestamps are ISO-8601 UTC strings (`2024-01-15T10:30:00Z`), matching
/// what the store persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub repo: String,
    pub description: String,
    pub status: TaskState,
    pub model: String,
    pub retries: u32,
    pub max_retries: u32,
    pub session_id: Option<String>,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub log_file: Option<String>,
    pub error: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl Task {
    /// Branch name convention for this task's worktree.
    pub fn feature_branch(&self) -> String {
        format!("feature/{}", self.id)
    }

    /// Whether this task is itself a diagnostic subtask (`t101-diag-1`).
    /// Diagnostics never self-heal.
    pub fn is_diagnostic(&self) -> bool {
        self.id
            .rsplit_once("-diag-")
            .is_some_and(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Worker PID recorded in `session_id` (`pid:<N>`), if any.
    pub fn worker_pid(&self) -> Option<u32> {
        self.session_id
            .as_deref()
            .and_then(|s| s.strip_prefix("pid:"))
            .and_then(|n| n.parse().ok())
    }
}

/// Batch status labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Active,
    Paused,
    Complete,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Paused => "paused",
            BatchStatus::Complete => "complete",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BatchStatus::Active),
            "paused" => Some(BatchStatus::Paused),
            "complete" => Some(BatchStatus::Complete),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release bump requested when a batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    Major,
    Minor,
    Patch,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Major => "major",
            ReleaseType::Minor => "minor",
            ReleaseType::Patch => "patch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "major" => Some(ReleaseType::Major),
            "minor" => Some(ReleaseType::Minor),
            "patch" => Some(ReleaseType::Patch),
            _ => None,
        }
    }
}

/// A named collection of tasks sharing a concurrency budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: i64,
    pub name: String,
    pub concurrency: u32,
    pub max_load_factor: u32,
    pub status: BatchStatus,
    pub release_on_complete: bool,
    pub release_type: ReleaseType,
    pub created_at: String,
    pub updated_at: String,
}

/// One append-only audit record. `from_state` is empty on initial insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLogEntry {
    pub task_id: String,
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
    pub created_at: String,
}

/// Current UTC time in the store's timestamp format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels_round_trip() {
        for state in ALL_STATES {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn unknown_label_rejected() {
        assert_eq!(TaskState::parse("nonsense"), None);
        assert_eq!(TaskState::parse(""), None);
    }

    #[test]
    fn terminal_for_batch_set_is_exact() {
        let terminal: Vec<&str> = ALL_STATES
            .iter()
            .filter(|s| s.is_terminal_for_batch())
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            terminal,
            ["complete", "merged", "deployed", "verified", "failed", "cancelled"]
        );
    }

    #[test]
    fn diagnostic_id_detection() {
        let mut t = sample_task("t101");
        assert!(!t.is_diagnostic());
        t.id = "t101-diag-1".to_string();
        assert!(t.is_diagnostic());
        t.id = "t101-diag-".to_string();
        assert!(!t.is_diagnostic());
        t.id = "t101-diagnose".to_string();
        assert!(!t.is_diagnostic());
    }

    #[test]
    fn worker_pid_parsed_from_session() {
        let mut t = sample_task("t101");
        assert_eq!(t.worker_pid(), None);
        t.session_id = Some("pid:4242".to_string());
        assert_eq!(t.worker_pid(), Some(4242));
        t.session_id = Some("tabby:main".to_string());
        assert_eq!(t.worker_pid(), None);
    }

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            repo: "/tmp/repo".to_string(),
            description: "test".to_string(),
            status: TaskState::Queued,
            model: "coding".to_string(),
            retries: 0,
            max_retries: 3,
            session_id: None,
            worktree: None,
            branch: None,
            log_file: None,
            error: None,
            pr_url: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }
}
