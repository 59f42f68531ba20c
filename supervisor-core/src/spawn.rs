//! Detached worker launch.
//!
//! Workers MUST keep running after the supervisor (or its cron-invoked
//! parent) exits. The launch therefore puts the worker in a brand-new
//! session (`setsid`), detaches it from the controlling terminal, nulls
//! stdin, and routes stdout+stderr into the task's log file. A thin `sh`
//! wrapper appends `EXIT:<code>` as the log's final line — the evaluator's
//! only deterministic exit signal once the supervisor is long gone.

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Launch `program args…` fully detached.
///
/// Returns the wrapper shell's PID — the root of the worker process tree.
/// `env` entries are set on the worker (the prompt travels by env var, never
/// by shell interpolation).
pub fn spawn_detached(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    workdir: &Path,
    log_file: &Path,
) -> Result<u32> {
    // `"$@"` keeps the worker arguments exactly as given; the trailer write
    // runs in the same wrapper so it survives any worker exit path except
    // SIGKILL of the wrapper itself.
    const WRAPPER: &str =
        r#""$@" < /dev/null >> "$SUPERVISOR_LOG" 2>&1; printf 'EXIT:%s\n' "$?" >> "$SUPERVISOR_LOG""#;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(WRAPPER)
        .arg("sh")
        .arg(program)
        .args(args)
        .current_dir(workdir)
        .env("SUPERVISOR_LOG", log_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (k, v) in env {
        cmd.env(k, v);
    }

    // New session + new process group, so the worker is not in the
    // supervisor's (or cron's) session and outlives both.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("launching worker: {program}"))?;
    Ok(child.id())
}
