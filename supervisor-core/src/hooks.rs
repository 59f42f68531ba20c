//! Lifecycle notification hooks.
//!
//! Executables under `<data dir>/hooks/` are fired at task and batch
//! milestones with `SUPERVISOR_*` env vars describing the event. Hooks are
//! the notification sink: mail, chat, issue tagging all hang off them.
//! Failures are ignored; a broken hook never stalls the pulse.

use std::path::Path;
use std::process::{Command, Stdio};

/// Hard cap on hook runtime.
const HOOK_TIMEOUT_SECS: u64 = 30;

/// Fire `<hooks_dir>/<name>` with the given env, if it exists.
/// Returns true when the hook ran and exited zero.
pub fn fire_hook(hooks_dir: &Path, name: &str, env: &[(&str, &str)]) -> bool {
    let hook = hooks_dir.join(name);
    if !hook.is_file() {
        return false;
    }
    let mut cmd = Command::new("timeout");
    cmd.arg(HOOK_TIMEOUT_SECS.to_string())
        .arg(&hook)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.status().map(|s| s.success()).unwrap_or(false)
}

/// Convenience: fire the task-event hook for a terminal outcome.
pub fn fire_task_hook(hooks_dir: &Path, event: &str, task_id: &str, repo: &str, detail: &str) {
    let name = format!("on-task-{event}");
    let _ = fire_hook(
        hooks_dir,
        &name,
        &[
            ("SUPERVISOR_EVENT", event),
            ("SUPERVISOR_TASK", task_id),
            ("SUPERVISOR_REPO", repo),
            ("SUPERVISOR_DETAIL", detail),
        ],
    );
}
