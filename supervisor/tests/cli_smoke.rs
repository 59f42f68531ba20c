//! Binary smoke tests for the `supervisor` CLI.
//!
//! These run the actual compiled binary with `assert_cmd` against a
//! throwaway data dir, exercising the command surface end to end: init,
//! add, batch, list, status, forced transitions, reset, cancel, and a full
//! pulse with a simulated finished worker. The worker CLI is pointed at a
//! stub shell script so no real provider is ever contacted.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn supervisor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("supervisor").unwrap();
    cmd.env("AIDEVOPS_SUPERVISOR_DIR", dir.path())
        // No real provider in CI: point both CLIs at a nonexistent binary.
        .env("SUPERVISOR_WORKER_CLI", "no-such-worker-cli")
        .env("SUPERVISOR_EVAL_CLI", "no-such-eval-cli");
    cmd
}

fn add_task(dir: &TempDir, repo: &Path, id: &str) {
    supervisor(dir)
        .args(["add", id, "--repo", repo.to_str().unwrap(), "--description", "implement foo"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("[{id}] queued")));
}

// ── Binary builds and runs ──────────────────────────────────────────────────

#[test]
fn version_flag() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("supervisor "));
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    let output = supervisor(&dir).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    for cmd in &[
        "init",
        "add",
        "batch",
        "dispatch",
        "reprompt",
        "evaluate",
        "pulse",
        "status",
        "list",
        "transition",
        "reset",
        "cancel",
        "cleanup",
        "kill-workers",
        "pr-check",
        "pr-merge",
        "pr-lifecycle",
        "verify",
        "cron",
        "watch",
        "self-heal",
        "doctor",
        "db",
    ] {
        assert!(
            stdout.contains(cmd),
            "Help text should mention '{cmd}' subcommand"
        );
    }
}

// ── Init & add ──────────────────────────────────────────────────────────────

#[test]
fn init_creates_database() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    assert!(dir.path().join("supervisor.db").exists());
}

#[test]
fn add_then_status_and_list() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    add_task(&dir, repo.path(), "t100");

    supervisor(&dir)
        .args(["status", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t100 — queued"))
        .stdout(predicate::str::contains("implement foo"));

    supervisor(&dir)
        .args(["list", "--state", "queued"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t100"))
        .stdout(predicate::str::contains("1 task(s)"));

    // JSON output parses and carries the status.
    let out = supervisor(&dir)
        .args(["list", "--format", "json"])
        .output()
        .unwrap();
    let parsed: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("list --format json must emit valid JSON");
    assert_eq!(parsed[0]["id"], "t100");
    assert_eq!(parsed[0]["status"], "queued");
}

#[test]
fn duplicate_add_fails() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t100");
    supervisor(&dir)
        .args(["add", "t100", "--repo", repo.path().to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn unknown_state_filter_is_a_user_error() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    supervisor(&dir)
        .args(["list", "--state", "daydreaming"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown state"));
}

// ── Batches ─────────────────────────────────────────────────────────────────

#[test]
fn batch_create_enrol_and_status() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    add_task(&dir, repo.path(), "t2");

    supervisor(&dir)
        .args(["batch", "sprint-1", "--concurrency", "2", "--tasks", "t1,t2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sprint-1 created with 2 task(s)"));

    supervisor(&dir)
        .args(["status", "sprint-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("batch sprint-1 — active"))
        .stdout(predicate::str::contains("t1"))
        .stdout(predicate::str::contains("t2"));

    supervisor(&dir)
        .args(["pause", "sprint-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sprint-1 → paused"));

    supervisor(&dir)
        .args(["resume", "sprint-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sprint-1 → active"));
}

#[test]
fn batch_completes_when_members_cancelled() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["batch", "b1", "--tasks", "t1"])
        .assert()
        .success();

    supervisor(&dir).args(["cancel", "t1"]).assert().success();

    supervisor(&dir)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("batch b1"))
        .stdout(predicate::str::contains("complete"));
}

// ── Transitions, reset, cancel ──────────────────────────────────────────────

#[test]
fn forced_transition_and_reset() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");

    supervisor(&dir)
        .args(["transition", "t1", "failed", "--error", "manual test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[t1] → failed"));

    supervisor(&dir)
        .args(["status", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("error:"))
        .stdout(predicate::str::contains("manual test"))
        .stdout(predicate::str::contains("forced: operator transition"));

    supervisor(&dir).args(["reset", "t1"]).assert().success();
    supervisor(&dir)
        .args(["status", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t1 — queued"))
        .stdout(predicate::str::contains("retries:  0/3"));
}

#[test]
fn transition_to_unknown_state_fails() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["transition", "t1", "sideways"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown state"));
}

#[test]
fn cancel_unknown_target_fails() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    supervisor(&dir)
        .args(["cancel", "t999"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no task or batch"));
}

// ── Dispatch gating ─────────────────────────────────────────────────────────

#[test]
fn dispatch_with_dead_provider_exits_three() {
    let dir = TempDir::new().unwrap();
    // A real git repo so the worktree step would succeed if reached.
    let repo_dir = TempDir::new().unwrap();
    let repo = repo_dir.path().join("demo");
    fs::create_dir(&repo).unwrap();
    for args in [
        vec!["init", "--quiet"],
        vec!["checkout", "-q", "-b", "main"],
        vec!["config", "user.email", "t@localhost"],
        vec!["config", "user.name", "t"],
    ] {
        std::process::Command::new("git")
            .arg("-C")
            .arg(&repo)
            .args(&args)
            .status()
            .unwrap();
    }
    fs::write(repo.join("README.md"), "# demo\n").unwrap();
    for args in [vec!["add", "."], vec!["commit", "-q", "-m", "init"]] {
        std::process::Command::new("git")
            .arg("-C")
            .arg(&repo)
            .args(&args)
            .status()
            .unwrap();
    }

    add_task(&dir, &repo, "t1");
    supervisor(&dir).args(["dispatch", "t1"]).assert().code(3);

    // The task must still be queued — probe failure costs nothing.
    supervisor(&dir)
        .args(["status", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t1 — queued"));
}

#[test]
fn dispatch_of_non_queued_task_is_user_error() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["transition", "t1", "complete"])
        .assert()
        .success();
    supervisor(&dir)
        .args(["dispatch", "t1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not dispatchable"));
}

// ── Pulse ───────────────────────────────────────────────────────────────────

#[test]
fn quiet_pulse_succeeds_and_prints_summary() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    supervisor(&dir)
        .arg("pulse")
        .assert()
        .success()
        .stderr(predicate::str::contains("pulse summary"));
    assert!(dir.path().join("events.ndjson").exists());
}

#[test]
fn pulse_evaluates_finished_worker_log() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t100");

    // Simulate a dispatched worker that finished with a PR and died.
    let log = dir.path().join("t100.log");
    fs::write(
        &log,
        "working…\nhttps://github.com/o/r/pull/42\nFULL_LOOP_COMPLETE\nEXIT:0\n",
    )
    .unwrap();
    supervisor(&dir)
        .args(["transition", "t100", "dispatched"])
        .assert()
        .success();
    supervisor(&dir)
        .args(["transition", "t100", "running"])
        .assert()
        .success();
    supervisor(&dir)
        .args([
            "db",
            &format!(
                "UPDATE tasks SET log_file = '{}', session_id = 'pid:3999999', worktree = '/nonexistent/wt' WHERE id = 't100'",
                log.display()
            ),
        ])
        .assert()
        .success();

    supervisor(&dir).arg("pulse").assert().success();

    supervisor(&dir)
        .args(["status", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pr:"))
        .stdout(predicate::str::contains("https://github.com/o/r/pull/42"));
}

#[test]
fn evaluate_no_ai_blocks_on_auth_error() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");

    let log = dir.path().join("t1.log");
    fs::write(&log, "Permission denied (publickey)\nEXIT:128\n").unwrap();
    supervisor(&dir)
        .args(["transition", "t1", "dispatched"])
        .assert()
        .success();
    supervisor(&dir)
        .args(["transition", "t1", "running"])
        .assert()
        .success();
    supervisor(&dir)
        .args([
            "db",
            &format!("UPDATE tasks SET log_file = '{}' WHERE id = 't1'", log.display()),
        ])
        .assert()
        .success();

    supervisor(&dir)
        .args(["evaluate", "t1", "--no-ai"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verdict: blocked:auth_error"));

    supervisor(&dir)
        .args(["status", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t1 — blocked"));
}

// ── Verification ────────────────────────────────────────────────────────────

#[test]
fn verify_runs_directives_and_writes_proof_log() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    fs::write(repo.path().join("README.md"), "# demo\n\n## Install\n").unwrap();
    fs::write(
        repo.path().join("VERIFY.md"),
        "- [ ] v001 t100 readme sections\n  check: file-exists README.md\n  check: rg \"^## Install\" README.md\n",
    )
    .unwrap();

    add_task(&dir, repo.path(), "t100");
    supervisor(&dir)
        .args(["transition", "t100", "deployed"])
        .assert()
        .success();

    supervisor(&dir)
        .args(["verify", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verified"));

    let proof = fs::read_to_string(repo.path().join("todo/verify-proof-log.md")).unwrap();
    assert!(proof.contains("## v001 t100 | PASSED |"));

    supervisor(&dir)
        .args(["status", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t100 — verified"));
}

#[test]
fn verify_failure_lands_in_verify_failed_and_reruns() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    fs::write(repo.path().join("README.md"), "# demo\n").unwrap();
    fs::write(
        repo.path().join("VERIFY.md"),
        "- [ ] v001 t100 impossible\n  check: rg \"^## NotPresent\" README.md\n",
    )
    .unwrap();

    add_task(&dir, repo.path(), "t100");
    supervisor(&dir)
        .args(["transition", "t100", "deployed"])
        .assert()
        .success();
    supervisor(&dir).args(["verify", "t100"]).assert().success();
    supervisor(&dir)
        .args(["status", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t100 — verify_failed"));
    let proof = fs::read_to_string(repo.path().join("todo/verify-proof-log.md")).unwrap();
    assert!(proof.contains("| FAILED |"));

    // Fix the repo and re-run: verify_failed → verifying → verified.
    fs::write(repo.path().join("README.md"), "# demo\n## NotPresent\n").unwrap();
    supervisor(&dir).args(["verify", "t100"]).assert().success();
    supervisor(&dir)
        .args(["status", "t100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t100 — verified"));
}

// ── Self-heal ───────────────────────────────────────────────────────────────

#[test]
fn self_heal_creates_single_diagnostic() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["transition", "t1", "failed", "--error", "failed:max_retries"])
        .assert()
        .success();

    supervisor(&dir)
        .args(["self-heal", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created diagnostic t1-diag-1"));

    // Recursion guard: the diagnostic cannot be healed, and the parent's
    // budget of one diagnostic is spent.
    supervisor(&dir).args(["self-heal", "t1"]).assert().code(1);
    supervisor(&dir)
        .args(["transition", "t1-diag-1", "failed", "--error", "failed:max_retries"])
        .assert()
        .success();
    supervisor(&dir)
        .args(["self-heal", "t1-diag-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not eligible"));
}

#[test]
fn self_heal_refuses_hard_blockers() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["transition", "t1", "blocked", "--error", "blocked:auth_error"])
        .assert()
        .success();
    supervisor(&dir)
        .args(["self-heal", "t1"])
        .assert()
        .code(1);
}

// ── Hygiene ─────────────────────────────────────────────────────────────────

#[test]
fn cleanup_dry_run_then_real() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir).args(["cancel", "t1"]).assert().success();

    fs::create_dir_all(dir.path().join("pids")).unwrap();
    fs::write(dir.path().join("pids/t1.pid"), "3999999\n").unwrap();

    supervisor(&dir)
        .args(["cleanup", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[dry-run]"));
    assert!(dir.path().join("pids/t1.pid").exists());

    supervisor(&dir).arg("cleanup").assert().success();
    assert!(!dir.path().join("pids/t1.pid").exists());
}

#[test]
fn kill_workers_dry_run_reports_count() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir).arg("init").assert().success();
    supervisor(&dir)
        .args(["kill-workers", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("orphan(s)"));
}

// ── Admin ───────────────────────────────────────────────────────────────────

#[test]
fn db_verb_runs_sql() {
    let dir = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    add_task(&dir, repo.path(), "t1");
    supervisor(&dir)
        .args(["db", "SELECT id, status FROM tasks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t1\tqueued"));

    supervisor(&dir)
        .arg("db")
        .assert()
        .success()
        .stdout(predicate::str::contains("supervisor.db"));
}

#[test]
fn cron_status_without_install() {
    let dir = TempDir::new().unwrap();
    supervisor(&dir)
        .args(["cron", "status"])
        .assert()
        .stdout(
            predicate::str::contains("not installed").or(predicate::str::contains("installed:")),
        );
}
