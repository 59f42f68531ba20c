//! Pre-dispatch provider health probe.
//!
//! Before launching a worker, a trivial prompt ("Reply with exactly: OK")
//! goes to the chosen provider/model with a 15-second hard timeout. An OK
//! result is cached two ways: a file under `<data dir>/health/` honoured for
//! 5 minutes across pulses, and an in-memory verified set that skips even
//! the file check within one pulse. A failed probe aborts the dispatch and
//! tells the pulse to stop dispatching — twenty queued tasks must not
//! hammer a dead provider in one pass.

use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Hard wall-clock cap on one probe.
pub const PROBE_TIMEOUT_SECS: u64 = 15;

/// How long a cached OK is trusted.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(300);

const PROBE_PROMPT: &str = "Reply with exactly: OK";

fn failure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)endpoints failed|quota protection|over.*usage|quota reset|503|service unavailable")
            .unwrap()
    })
}

/// Pure probe-result classification: was this response healthy?
pub fn is_healthy_output(exit_code: Option<i32>, stdout: &str) -> bool {
    // `timeout` reports 124 when it had to kill the probe.
    if exit_code == Some(124) {
        return false;
    }
    if stdout.trim().is_empty() && exit_code != Some(0) {
        return false;
    }
    !failure_re().is_match(stdout)
}

/// Cache key: `<cli>-<model slug>`.
pub fn cache_key(cli: &str, model: &str) -> String {
    let slug: String = model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{cli}-{slug}")
}

/// Stateful probe for one pulse. Construct once per pulse; the in-memory
/// verified set dies with it.
pub struct HealthProbe {
    health_dir: PathBuf,
    verified_this_pulse: HashSet<String>,
}

impl HealthProbe {
    pub fn new(health_dir: PathBuf) -> Self {
        Self {
            health_dir,
            verified_this_pulse: HashSet::new(),
        }
    }

    /// True when the provider answered (or a cached OK is still fresh).
    pub fn probe(&mut self, cli: &str, model: &str) -> bool {
        let key = cache_key(cli, model);
        if self.verified_this_pulse.contains(&key) {
            return true;
        }
        if self.cache_fresh(&key) {
            self.verified_this_pulse.insert(key);
            return true;
        }
        if self.run_probe(cli, model) {
            let _ = self.write_cache(&key);
            self.verified_this_pulse.insert(key);
            true
        } else {
            false
        }
    }

    fn cache_fresh(&self, key: &str) -> bool {
        fs::metadata(self.health_dir.join(key))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age < HEALTH_CACHE_TTL)
    }

    fn write_cache(&self, key: &str) -> Result<()> {
        fs::create_dir_all(&self.health_dir)?;
        fs::write(self.health_dir.join(key), crate::task::utc_now())?;
        Ok(())
    }

    fn run_probe(&self, cli: &str, model: &str) -> bool {
        let out = Command::new("timeout")
            .arg(PROBE_TIMEOUT_SECS.to_string())
            .arg(cli)
            .args(["--model", model, "-p", PROBE_PROMPT])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match out {
            Ok(o) => is_healthy_output(o.status.code(), &String::from_utf8_lossy(&o.stdout)),
            Err(_) => false,
        }
    }
}
