//! AI verdict client — evaluator tier 4.
//!
//! The provider is shelled out to as a CLI (`timeout 60 <cli> --model <m> -p
//! <prompt>`), inheriting the operator's existing auth session the same way
//! the `gh` gateway does. The wire format is a single line:
//! `VERDICT:{complete|retry|blocked}:<token>`.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};

/// Hard timeout for a verdict call.
pub const VERDICT_TIMEOUT_SECS: u64 = 60;

/// Parsed verdict from the evaluator model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiVerdict {
    Complete(String),
    Retry(String),
    Blocked(String),
}

impl AiVerdict {
    pub fn as_wire(&self) -> String {
        match self {
            AiVerdict::Complete(d) => format!("VERDICT:complete:{d}"),
            AiVerdict::Retry(d) => format!("VERDICT:retry:{d}"),
            AiVerdict::Blocked(d) => format!("VERDICT:blocked:{d}"),
        }
    }
}

/// Find and parse the first `VERDICT:` line in a model response. The model
/// is told to emit exactly one, but chatter around it is tolerated.
pub fn parse_verdict(output: &str) -> Option<AiVerdict> {
    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("VERDICT:") else {
            continue;
        };
        let (kind, detail) = match rest.split_once(':') {
            Some((k, d)) => (k, d.trim()),
            None => (rest, ""),
        };
        let detail = if detail.is_empty() { "unspecified" } else { detail };
        return match kind {
            "complete" => Some(AiVerdict::Complete(detail.to_string())),
            "retry" => Some(AiVerdict::Retry(detail.to_string())),
            "blocked" => Some(AiVerdict::Blocked(detail.to_string())),
            _ => None,
        };
    }
    None
}

/// Fixed instruction prefix for the evaluator model.
const EVAL_SYSTEM_PROMPT: &str = "You are judging the outcome of an automated coding worker from \
its log tail. Respond with EXACTLY ONE line and nothing else, in the form \
VERDICT:<kind>:<detail> where <kind> is one of complete, retry, blocked and \
<detail> is a short lowercase token (e.g. tests_failing, needs_credentials). \
Use complete only if the work is clearly finished, blocked only if a human \
must intervene, retry otherwise.";

/// Build the evaluation prompt from the task description and log tail.
pub fn build_eval_prompt(description: &str, log_tail: &str) -> String {
    format!("{EVAL_SYSTEM_PROMPT}\n\nTask description:\n{description}\n\nLog tail:\n{log_tail}\n")
}

/// Port for the verdict call, mockable in evaluator tests.
pub trait VerdictClient {
    /// Send the prompt; return the raw model output.
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// Concrete adapter shelling out to the configured evaluator CLI.
pub struct CliVerdictClient {
    pub cli: String,
    pub model: String,
}

impl VerdictClient for CliVerdictClient {
    fn ask(&self, prompt: &str) -> Result<String> {
        let out = Command::new("timeout")
            .arg(VERDICT_TIMEOUT_SECS.to_string())
            .arg(&self.cli)
            .args(["--model", &self.model, "-p", prompt])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("running evaluator cli: {}", self.cli))?;
        if !out.status.success() {
            anyhow::bail!(
                "evaluator cli exited {}",
                out.status.code().unwrap_or(-1)
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_verdict_line() {
        assert_eq!(
            parse_verdict("VERDICT:retry:tests_flaky\n"),
            Some(AiVerdict::Retry("tests_flaky".to_string()))
        );
    }

    #[test]
    fn tolerates_chatter_around_the_line() {
        let out = "Looking at the log...\nVERDICT:blocked:needs_credentials\nHope that helps!";
        assert_eq!(
            parse_verdict(out),
            Some(AiVerdict::Blocked("needs_credentials".to_string()))
        );
    }

    #[test]
    fn missing_detail_becomes_unspecified() {
        assert_eq!(
            parse_verdict("VERDICT:complete"),
            Some(AiVerdict::Complete("unspecified".to_string()))
        );
        assert_eq!(
            parse_verdict("VERDICT:complete:"),
            Some(AiVerdict::Complete("unspecified".to_string()))
        );
    }

    #[test]
    fn unknown_kind_or_absent_line_is_none() {
        assert_eq!(parse_verdict("VERDICT:maybe:later"), None);
        assert_eq!(parse_verdict("the task looks complete to me"), None);
        assert_eq!(parse_verdict(""), None);
    }

    #[test]
    fn wire_round_trip() {
        let v = AiVerdict::Retry("rate_limited".to_string());
        assert_eq!(parse_verdict(&v.as_wire()), Some(v));
    }

    #[test]
    fn prompt_carries_description_and_tail() {
        let p = build_eval_prompt("implement foo", "line1\nEXIT:1");
        assert!(p.contains("implement foo"));
        assert!(p.contains("EXIT:1"));
        assert!(p.contains("VERDICT:<kind>:<detail>"));
    }
}
