//! Worker-log parsing.
//!
//! Logs can exceed 100 MB, so every scan works on a bounded tail read —
//! never the whole file. The extraction functions are pure over the tail
//! text; the evaluator composes them into its tier order.

use anyhow::Result;
use regex::Regex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;

/// Upper bound on how much of a log any scan reads.
pub const TAIL_READ_BYTES: u64 = 256 * 1024;

/// PR URL patterns, exact per the wire convention.
fn pr_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+|https://gitlab\.[^/\s]+/[^/\s]+/[^/\s]+/-/merge_requests/\d+",
        )
        .unwrap()
    })
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b429\b|rate.limit").unwrap())
}

/// Read at most [`TAIL_READ_BYTES`] from the end of `path`.
pub fn read_tail(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > TAIL_READ_BYTES {
        file.seek(SeekFrom::End(-(TAIL_READ_BYTES as i64)))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    // Drop a leading partial line when the read started mid-line.
    if len > TAIL_READ_BYTES {
        if let Some(idx) = text.find('\n') {
            return Ok(text[idx + 1..].to_string());
        }
    }
    Ok(text.into_owned())
}

/// The last `n` lines of `text`, preserving order.
pub fn last_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

/// Deterministic signals pulled from a log tail (evaluator tier 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSignals {
    /// Exit code from the final `EXIT:<code>` line, if present.
    pub exit_code: Option<i32>,
    /// Worker declared the full loop done (dispatch through PR).
    pub full_loop_complete: bool,
    /// Worker declared the task itself done (no PR claim).
    pub task_complete: bool,
    /// First PR/MR URL appearing in the tail.
    pub pr_url: Option<String>,
}

impl LogSignals {
    /// Exit codes delivered by signals (SIGINT / SIGKILL / SIGTERM).
    pub fn signal_exit(&self) -> Option<&'static str> {
        match self.exit_code {
            Some(130) => Some("interrupted_sigint"),
            Some(137) => Some("killed_sigkill"),
            Some(143) => Some("terminated_sigterm"),
            _ => None,
        }
    }
}

/// Extract tier-1 signals from a log tail.
pub fn extract_signals(tail: &str) -> LogSignals {
    // EXIT: is appended as the last line, but tolerate trailing noise from
    // interleaved writers by scanning backwards.
    let exit_code = tail
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix("EXIT:"))
        .and_then(|code| code.trim().parse().ok());

    LogSignals {
        exit_code,
        full_loop_complete: tail.contains("FULL_LOOP_COMPLETE"),
        task_complete: tail.contains("TASK_COMPLETE"),
        pr_url: pr_url_re().find(tail).map(|m| m.as_str().to_string()),
    }
}

/// Backend-infrastructure failure patterns (evaluator tier 2). These are
/// provider outages, never the worker's fault, and always retriable.
pub fn backend_error(tail: &str) -> Option<&'static str> {
    let lower = tail.to_lowercase();
    for (needle, label) in [
        ("endpoints failed", "endpoints_failed"),
        ("gateway error", "gateway_error"),
        ("503 service unavailable", "service_unavailable"),
        ("quota protection", "quota_protection"),
        ("quota exhausted", "quota_exhausted"),
    ] {
        if lower.contains(needle) {
            return Some(label);
        }
    }
    None
}

/// What a last-20-lines heuristic scan found (evaluator tier 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFinding {
    /// Credentials problem — human intervention, never retried.
    AuthError,
    /// Git-level conflict in the worktree.
    MergeConflict,
    /// Worker or tool ran out of memory.
    OutOfMemory,
    /// Provider rate limit.
    RateLimited,
    /// Operation timed out.
    Timeout,
}

impl TailFinding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TailFinding::AuthError => "auth_error",
            TailFinding::MergeConflict => "merge_conflict",
            TailFinding::OutOfMemory => "out_of_memory",
            TailFinding::RateLimited => "rate_limited",
            TailFinding::Timeout => "timeout",
        }
    }

    /// Blocked findings need a human; the rest retry.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            TailFinding::AuthError | TailFinding::MergeConflict | TailFinding::OutOfMemory
        )
    }
}

/// Scan only the last 20 lines for error heuristics. Callers must gate this
/// on a non-zero exit — generated content routinely contains these words.
pub fn scan_tail_heuristics(tail: &str) -> Option<TailFinding> {
    let window = last_lines(tail, 20).join("\n");
    let lower = window.to_lowercase();

    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("permission denied")
        || lower.contains("unauthorized")
    {
        return Some(TailFinding::AuthError);
    }
    if window.contains("CONFLICT") || lower.contains("conflict marker") {
        return Some(TailFinding::MergeConflict);
    }
    if lower.contains("out of memory") || window.contains("ENOMEM") || lower.contains("heap exceeded")
    {
        return Some(TailFinding::OutOfMemory);
    }
    if rate_limit_re().is_match(&window) {
        return Some(TailFinding::RateLimited);
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return Some(TailFinding::Timeout);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn extracts_exit_and_markers() {
        let s = extract_signals("working...\nFULL_LOOP_COMPLETE\nEXIT:0\n");
        assert_eq!(s.exit_code, Some(0));
        assert!(s.full_loop_complete);
        assert!(!s.task_complete);
    }

    #[test]
    fn exit_line_found_despite_trailing_noise() {
        let s = extract_signals("EXIT:1\nlate flush from child process\n");
        assert_eq!(s.exit_code, Some(1));
    }

    #[test]
    fn github_and_gitlab_urls_detected() {
        let s = extract_signals("see https://github.com/o/r/pull/42 for details");
        assert_eq!(s.pr_url.as_deref(), Some("https://github.com/o/r/pull/42"));

        let s = extract_signals("MR: https://gitlab.example.com/g/p/-/merge_requests/7");
        assert_eq!(
            s.pr_url.as_deref(),
            Some("https://gitlab.example.com/g/p/-/merge_requests/7")
        );
    }

    #[test]
    fn near_miss_urls_rejected() {
        assert!(extract_signals("https://github.com/o/r/issues/42").pr_url.is_none());
        assert!(extract_signals("https://example.com/o/r/pull/42").pr_url.is_none());
    }

    #[test]
    fn signal_exit_codes_mapped() {
        let mut s = LogSignals::default();
        for (code, label) in [
            (130, "interrupted_sigint"),
            (137, "killed_sigkill"),
            (143, "terminated_sigterm"),
        ] {
            s.exit_code = Some(code);
            assert_eq!(s.signal_exit(), Some(label));
        }
        s.exit_code = Some(1);
        assert_eq!(s.signal_exit(), None);
    }

    #[test]
    fn backend_errors_match_anywhere_in_tail() {
        assert_eq!(
            backend_error("early on: all 3 endpoints failed\n…thousands of lines…"),
            Some("endpoints_failed")
        );
        assert_eq!(backend_error("HTTP 503 Service Unavailable"), Some("service_unavailable"));
        assert_eq!(backend_error("Quota exhausted for project"), Some("quota_exhausted"));
        assert_eq!(backend_error("all fine"), None);
    }

    #[test]
    fn tail_heuristics_only_see_last_twenty_lines() {
        // An auth error 25 lines up must not fire.
        let mut log = String::from("Permission denied (publickey)\n");
        for i in 0..24 {
            log.push_str(&format!("line {i}\n"));
        }
        assert_eq!(scan_tail_heuristics(&log), None);

        log.push_str("fatal: unauthorized\n");
        assert_eq!(scan_tail_heuristics(&log), Some(TailFinding::AuthError));
    }

    #[test]
    fn heuristic_kinds_and_policy() {
        assert_eq!(
            scan_tail_heuristics("CONFLICT (content): Merge conflict in src/a.rs"),
            Some(TailFinding::MergeConflict)
        );
        assert_eq!(
            scan_tail_heuristics("FATAL ERROR: JavaScript heap exceeded"),
            Some(TailFinding::OutOfMemory)
        );
        assert_eq!(
            scan_tail_heuristics("HTTP 429 rate.limit.exceeded"),
            Some(TailFinding::RateLimited)
        );
        assert_eq!(
            scan_tail_heuristics("request timed out after 30s"),
            Some(TailFinding::Timeout)
        );

        assert!(TailFinding::AuthError.is_blocking());
        assert!(TailFinding::MergeConflict.is_blocking());
        assert!(TailFinding::OutOfMemory.is_blocking());
        assert!(!TailFinding::RateLimited.is_blocking());
        assert!(!TailFinding::Timeout.is_blocking());
    }

    #[test]
    fn auth_outranks_rate_limit_in_same_window() {
        assert_eq!(
            scan_tail_heuristics("401 unauthorized after 429 retries"),
            Some(TailFinding::AuthError)
        );
    }

    #[test]
    fn tail_read_bounds_large_files() {
        let mut f = NamedTempFile::new().unwrap();
        // Write well past the tail bound, then the signal lines.
        let filler = "x".repeat(1024);
        for _ in 0..600 {
            writeln!(f, "{filler}").unwrap();
        }
        writeln!(f, "https://github.com/o/r/pull/9").unwrap();
        writeln!(f, "EXIT:0").unwrap();
        f.flush().unwrap();

        let tail = read_tail(f.path()).unwrap();
        assert!(tail.len() as u64 <= TAIL_READ_BYTES);
        let s = extract_signals(&tail);
        assert_eq!(s.exit_code, Some(0));
        assert_eq!(s.pr_url.as_deref(), Some("https://github.com/o/r/pull/9"));
        // The bounded read must start on a line boundary.
        assert!(tail.starts_with('x'));
    }

    #[test]
    fn last_lines_short_input() {
        assert_eq!(last_lines("a\nb", 20), ["a", "b"]);
        assert_eq!(last_lines("", 20), Vec::<&str>::new());
    }
}
