//! Post-deploy verification.
//!
//! Independent re-check of claimed work, driven by declarative `check:`
//! directives in the repo's `VERIFY.md`. Each directive runs on its own;
//! the aggregate pass/fail is appended to the repo's proof log and decides
//! `verified` vs `verify_failed`.
//!
//! VERIFY.md format, one entry per verification id:
//!
//! ```text
//! - [ ] v001 t100 install section present
//!   check: file-exists README.md
//!   check: rg "^## Install" README.md
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::task::utc_now;

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `- [ ] v001 t100 title…`
    RE.get_or_init(|| Regex::new(r"^\s*- \[[ x-]\] (v\d+) (t\d+(?:\.\d+)*(?:-diag-\d+)?) (.*)$").unwrap())
}

/// One VERIFY.md entry: a verification id, its target task, and directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEntry {
    pub vid: String,
    pub tid: String,
    pub title: String,
    pub checks: Vec<String>,
}

/// Parse VERIFY.md. Directive lines (`check: …`) attach to the entry above
/// them; stray directives without an entry are dropped.
pub fn parse_verify_md(content: &str) -> Vec<VerifyEntry> {
    let mut entries: Vec<VerifyEntry> = Vec::new();
    for line in content.lines() {
        if let Some(caps) = entry_re().captures(line) {
            entries.push(VerifyEntry {
                vid: caps[1].to_string(),
                tid: caps[2].to_string(),
                title: caps[3].trim().to_string(),
                checks: Vec::new(),
            });
            continue;
        }
        let trimmed = line.trim();
        if let Some(directive) = trimmed.strip_prefix("check:") {
            if let Some(entry) = entries.last_mut() {
                entry.checks.push(directive.trim().to_string());
            }
        }
    }
    entries
}

/// Outcome of one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveResult {
    pub directive: String,
    pub passed: bool,
    pub summary: String,
}

/// Execute a single directive inside `repo`.
pub fn run_directive(repo: &Path, directive: &str) -> DirectiveResult {
    let (passed, summary) = match exec_directive(repo, directive) {
        Ok(pair) => pair,
        Err(e) => (false, format!("error: {e}")),
    };
    DirectiveResult {
        directive: directive.to_string(),
        passed,
        summary,
    }
}

fn exec_directive(repo: &Path, directive: &str) -> Result<(bool, String)> {
    let mut parts = directive.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "file-exists" => {
            let exists = repo.join(rest).exists();
            Ok((exists, if exists { "exists".into() } else { "missing".into() }))
        }
        "rg" => {
            let (pattern, path) = split_pattern_arg(rest)
                .with_context(|| format!("malformed rg directive: {directive}"))?;
            let re = Regex::new(&pattern).with_context(|| format!("bad pattern: {pattern}"))?;
            let content = std::fs::read_to_string(repo.join(&path))
                .with_context(|| format!("reading {path}"))?;
            let count = content.lines().filter(|l| re.is_match(l)).count();
            Ok((count >= 1, format!("{count} match(es)")))
        }
        "shellcheck" => run_check(repo, "shellcheck", &["-S", "warning", rest]),
        "bash" => {
            if let Some(script) = rest.strip_prefix("-n ") {
                run_check(repo, "bash", &["-n", script.trim()])
            } else {
                // Full test-script run; last output line is the summary.
                let out = Command::new("bash")
                    .arg(rest)
                    .current_dir(repo)
                    .stdin(Stdio::null())
                    .output()
                    .context("running bash script")?;
                let stdout = String::from_utf8_lossy(&out.stdout);
                let summary = stdout
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output")
                    .to_string();
                Ok((out.status.success(), summary))
            }
        }
        _ => anyhow::bail!("unknown directive verb: {verb}"),
    }
}

/// Split `"<pattern>" <path>` — the pattern may be quoted, the path follows.
fn split_pattern_arg(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim();
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        let pattern = stripped[..end].to_string();
        let path = stripped[end + 1..].trim().to_string();
        if path.is_empty() {
            return None;
        }
        Some((pattern, path))
    } else {
        let (pattern, path) = rest.split_once(char::is_whitespace)?;
        Some((pattern.to_string(), path.trim().to_string()))
    }
}

fn run_check(repo: &Path, program: &str, args: &[&str]) -> Result<(bool, String)> {
    let status = Command::new(program)
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("running {program}"))?;
    Ok((
        status.success(),
        format!("{program} exit {}", status.code().unwrap_or(-1)),
    ))
}

/// Aggregate verification result for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// `(vid, passed, directive results)` per matching entry.
    pub entries: Vec<(String, bool, Vec<DirectiveResult>)>,
    pub all_passed: bool,
}

impl VerifyReport {
    /// A task with no declared directives verifies trivially.
    pub fn no_directives(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run every VERIFY.md entry declared for `task_id` and append proof-log
/// blocks. Missing VERIFY.md means nothing was declared.
pub fn verify_task(repo: &Path, task_id: &str, user: &str) -> Result<VerifyReport> {
    let content = std::fs::read_to_string(repo.join("VERIFY.md")).unwrap_or_default();
    let entries: Vec<VerifyEntry> = parse_verify_md(&content)
        .into_iter()
        .filter(|e| e.tid == task_id)
        .collect();

    let mut report = VerifyReport {
        entries: Vec::new(),
        all_passed: true,
    };
    for entry in entries {
        let results: Vec<DirectiveResult> = entry
            .checks
            .iter()
            .map(|c| run_directive(repo, c))
            .collect();
        let passed = !results.is_empty() && results.iter().all(|r| r.passed);
        if !passed {
            report.all_passed = false;
        }
        append_proof(repo, &entry, passed, &results, user)?;
        report.entries.push((entry.vid.clone(), passed, results));
    }
    Ok(report)
}

/// Append one proof block:
/// `## <vid> <tid> | PASSED|FAILED | <timestamp> | by:<user>`.
fn append_proof(
    repo: &Path,
    entry: &VerifyEntry,
    passed: bool,
    results: &[DirectiveResult],
    user: &str,
) -> Result<()> {
    let proof_dir = repo.join("todo");
    std::fs::create_dir_all(&proof_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(proof_dir.join("verify-proof-log.md"))?;

    let outcome = if passed { "PASSED" } else { "FAILED" };
    writeln!(
        file,
        "## {} {} | {} | {} | by:{}",
        entry.vid,
        entry.tid,
        outcome,
        utc_now(),
        user
    )?;
    for r in results {
        let mark = if r.passed { "ok" } else { "FAIL" };
        writeln!(file, "- {mark}: `{}` — {}", r.directive, r.summary)?;
    }
    writeln!(file)?;
    Ok(())
}
