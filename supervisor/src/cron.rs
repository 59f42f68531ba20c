//! Crontab management for the periodic pulse.
//!
//! The entry is tagged with a trailing marker comment so install/uninstall
//! can find it without disturbing the rest of the user's crontab.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

use supervisor_core::config::Config;

const MARKER: &str = "# supervisor-pulse";

/// Current crontab content, empty when none exists.
fn read_crontab() -> String {
    Command::new("crontab")
        .arg("-l")
        .stderr(Stdio::null())
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
        .unwrap_or_default()
}

fn write_crontab(content: &str) -> Result<()> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .spawn()
        .context("spawning crontab")?;
    child
        .stdin
        .as_mut()
        .context("crontab stdin")?
        .write_all(content.as_bytes())?;
    let status = child.wait()?;
    if !status.success() {
        bail!("crontab update failed");
    }
    Ok(())
}

/// The crontab line for a given interval, with pulse output appended to the
/// data dir so cron runs are debuggable.
pub fn entry_line(exe: &str, data_dir: &str, interval_minutes: u32) -> String {
    format!("*/{interval_minutes} * * * * {exe} pulse >> {data_dir}/cron.log 2>&1 {MARKER}")
}

pub fn install(cfg: &Config, interval_minutes: u32) -> Result<i32> {
    if interval_minutes == 0 || interval_minutes > 59 {
        bail!("interval must be 1–59 minutes");
    }
    let exe = std::env::current_exe()?.display().to_string();
    let line = entry_line(&exe, &cfg.data_dir.display().to_string(), interval_minutes);

    let existing = read_crontab();
    let mut kept: Vec<&str> = existing.lines().filter(|l| !l.contains(MARKER)).collect();
    kept.push(&line);
    write_crontab(&format!("{}\n", kept.join("\n")))?;
    println!("installed: {line}");
    Ok(0)
}

pub fn uninstall() -> Result<i32> {
    let existing = read_crontab();
    let kept: Vec<&str> = existing.lines().filter(|l| !l.contains(MARKER)).collect();
    if kept.len() == existing.lines().count() {
        println!("no supervisor entry installed");
        return Ok(0);
    }
    let content = if kept.is_empty() {
        String::new()
    } else {
        format!("{}\n", kept.join("\n"))
    };
    write_crontab(&content)?;
    println!("uninstalled");
    Ok(0)
}

pub fn status() -> Result<i32> {
    let existing = read_crontab();
    match existing.lines().find(|l| l.contains(MARKER)) {
        Some(line) => {
            println!("installed: {line}");
            Ok(0)
        }
        None => {
            println!("not installed");
            Ok(1)
        }
    }
}
