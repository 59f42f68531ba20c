//! Outcome evaluator.
//!
//! Given a finished worker (process dead, log present), decide the next
//! state. Four tiers, applied in order, each able to short-circuit:
//!
//!   1. deterministic log signals (markers, PR URL, EXIT code)
//!   2. backend-infrastructure patterns (always retriable), and the
//!      clean-exit-no-signal rule
//!   3. heuristic error patterns on the last 20 lines (only when exit ≠ 0)
//!   2.5 git evidence from the worktree (before the AI tier)
//!   4. AI verdict (only when retries remain)
//!
//! The decision core is pure; I/O (log read, git inspection, the AI call)
//! happens in [`evaluate_task`].

use anyhow::Result;

use crate::logscan::{self, LogSignals};
use crate::verdict::{parse_verdict, AiVerdict, VerdictClient};

/// Evaluator decision: the task's next state plus a detail token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Complete(String),
    Retry(String),
    Blocked(String),
    Failed(String),
}

impl Verdict {
    pub fn as_wire(&self) -> String {
        match self {
            Verdict::Complete(d) => format!("complete:{d}"),
            Verdict::Retry(d) => format!("retry:{d}"),
            Verdict::Blocked(d) => format!("blocked:{d}"),
            Verdict::Failed(d) => format!("failed:{d}"),
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Verdict::Complete(d) | Verdict::Retry(d) | Verdict::Blocked(d) | Verdict::Failed(d) => d,
        }
    }
}

/// What the worktree says about progress (tier 2.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GitEvidence {
    /// Commits on the feature branch not on the base branch.
    pub commits_ahead: u32,
    /// Uncommitted changes in the worktree.
    pub uncommitted: bool,
}

/// Everything the pure decision needs about one finished worker.
#[derive(Debug, Clone)]
pub struct EvalInput {
    pub signals: LogSignals,
    pub tail: String,
    pub retries: u32,
    pub max_retries: u32,
    pub git: Option<GitEvidence>,
}

/// Result of a full evaluation, including the raw AI verdict when tier 4
/// fired (recorded to the state log for auditors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub ai_verdict_line: Option<String>,
}

fn no_ai(verdict: Verdict) -> Evaluation {
    Evaluation {
        verdict,
        ai_verdict_line: None,
    }
}

/// Run the tier cascade. `ai` is consulted only when tiers 1–3 and the git
/// evidence yield nothing and retries remain.
pub fn evaluate_tiers(
    input: &EvalInput,
    description: &str,
    ai: Option<&dyn VerdictClient>,
) -> Evaluation {
    let s = &input.signals;
    let exit = s.exit_code;
    let retries_left = input.retries < input.max_retries;

    // ── Tier 1: deterministic signals ────────────────────────────────────────
    if s.full_loop_complete {
        let detail = s.pr_url.clone().unwrap_or_else(|| "no_pr".to_string());
        return no_ai(Verdict::Complete(detail));
    }
    if s.task_complete && exit == Some(0) {
        return no_ai(Verdict::Complete("task_only".to_string()));
    }
    // A PR with a clean exit wins over every error heuristic: generated
    // content can legitimately contain "auth" or "error".
    if let (Some(url), Some(0)) = (&s.pr_url, exit) {
        return no_ai(Verdict::Complete(url.clone()));
    }

    // ── Tier 2: backend infrastructure (always non-final) ────────────────────
    if logscan::backend_error(&input.tail).is_some() {
        return no_ai(gate_retry(input, "backend_infrastructure_error"));
    }
    if exit == Some(0) && s.signal_exit().is_none() && s.pr_url.is_none() {
        // Worker ran out of context or soft-limited itself; try again.
        return no_ai(gate_retry(input, "clean_exit_no_signal"));
    }

    // ── Tier 3: heuristic patterns (only on failing exits) ───────────────────
    if exit.is_some_and(|c| c != 0) {
        if let Some(finding) = logscan::scan_tail_heuristics(&input.tail) {
            return no_ai(if finding.is_blocking() {
                Verdict::Blocked(finding.as_str().to_string())
            } else {
                gate_retry(input, finding.as_str())
            });
        }
        if let Some(signal) = s.signal_exit() {
            return no_ai(gate_retry(input, signal));
        }
    }

    // ── Tier 2.5: git evidence ───────────────────────────────────────────────
    if let Some(git) = input.git {
        if git.commits_ahead > 0 {
            return no_ai(Verdict::Complete("commits_only".to_string()));
        }
    }

    // ── Tier 4: AI verdict ───────────────────────────────────────────────────
    if retries_left {
        if let Some(client) = ai {
            let mut prompt = crate::verdict::build_eval_prompt(description, &input.tail);
            if input.git.is_some_and(|g| g.uncommitted) {
                prompt.push_str("\nNote: the worktree holds uncommitted changes from this attempt.\n");
            }
            match client.ask(&prompt).ok().as_deref().and_then(parse_verdict) {
                Some(v) => {
                    let line = v.as_wire();
                    let verdict = match v {
                        AiVerdict::Complete(d) => Verdict::Complete(d),
                        AiVerdict::Retry(d) => Verdict::Retry(d),
                        AiVerdict::Blocked(d) => Verdict::Blocked(d),
                    };
                    return Evaluation {
                        verdict,
                        ai_verdict_line: Some(line),
                    };
                }
                None => return no_ai(Verdict::Retry("ambiguous_ai_unavailable".to_string())),
            }
        }
        return no_ai(Verdict::Retry("ambiguous_no_evaluator".to_string()));
    }

    no_ai(Verdict::Failed("max_retries".to_string()))
}

/// Downgrade a retry to the terminal failure once the budget is spent.
fn gate_retry(input: &EvalInput, reason: &str) -> Verdict {
    if input.retries < input.max_retries {
        Verdict::Retry(reason.to_string())
    } else {
        Verdict::Failed("max_retries".to_string())
    }
}

/// I/O shell around [`evaluate_tiers`]: read the bounded log tail, gather
/// git evidence, and run the cascade.
pub fn evaluate_task(
    log_file: &std::path::Path,
    description: &str,
    retries: u32,
    max_retries: u32,
    git: Option<GitEvidence>,
    ai: Option<&dyn VerdictClient>,
) -> Result<Evaluation> {
    let tail = match logscan::read_tail(log_file) {
        Ok(t) => t,
        // A worker that never produced a log is indistinguishable from a
        // failed launch; retry covers both.
        Err(_) => {
            let input = EvalInput {
                signals: LogSignals::default(),
                tail: String::new(),
                retries,
                max_retries,
                git,
            };
            return Ok(no_ai(gate_retry(&input, "missing_log")));
        }
    };
    let signals = logscan::extract_signals(&tail);
    let input = EvalInput {
        signals,
        tail,
        retries,
        max_retries,
        git,
    };
    Ok(evaluate_tiers(&input, description, ai))
}
