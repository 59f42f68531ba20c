//! Runtime configuration for the supervisor.
//!
//! Resolution order: **env var > `<data dir>/config` file > hardcoded default**.
//!
//! ```text
//! Field               Env Var                        Config Key           Default
//! ─────────────────── ────────────────────────────── ──────────────────── ────────
//! data_dir            AIDEVOPS_SUPERVISOR_DIR        —                    ~/.aidevops/supervisor
//! worker_cli          SUPERVISOR_WORKER_CLI          worker_cli           claude
//! default_model      SUPERVISOR_MODEL               model                coding
//! eval_cli            SUPERVISOR_EVAL_CLI            eval_cli             (worker_cli)
//! eval_model          SUPERVISOR_EVAL_MODEL          eval_model           fast
//! max_concurrency     SUPERVISOR_MAX_CONCURRENCY     max_concurrency      8
//! worker_timeout      SUPERVISOR_WORKER_TIMEOUT      worker_timeout       3600s
//! dispatch_mode       SUPERVISOR_DISPATCH_MODE       dispatch_mode        headless
//! self_heal           SUPERVISOR_SELF_HEAL           self_heal            true
//! skip_review_triage  SUPERVISOR_SKIP_REVIEW_TRIAGE  skip_review_triage   false
//! auto_issue          SUPERVISOR_AUTO_ISSUE          auto_issue           false
//! pulse_lock_timeout  SUPERVISOR_PULSE_LOCK_TIMEOUT  pulse_lock_timeout   600s
//! self_mem_limit_mb   SUPERVISOR_SELF_MEM_LIMIT      self_mem_limit       512
//! max_diagnostics     —                              max_diagnostics      1
//! ```

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

/// How dispatched workers are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Fully detached background process (the default; survives cron exits).
    Headless,
    /// Worker launched in a terminal tab; session id is the tab handle.
    Tabby,
}

impl DispatchMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "headless" => Some(DispatchMode::Headless),
            "tabby" => Some(DispatchMode::Tabby),
            _ => None,
        }
    }
}

/// Runtime configuration, resolved once per invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all supervisor state (`AIDEVOPS_SUPERVISOR_DIR`).
    pub data_dir: PathBuf,
    /// Worker CLI binary (`SUPERVISOR_WORKER_CLI`; default "claude").
    pub worker_cli: String,
    /// Model tier handed to new tasks (`SUPERVISOR_MODEL`; default "coding").
    pub default_model: String,
    /// CLI used for the AI-verdict tier; defaults to `worker_cli`.
    pub eval_cli: String,
    /// Model tier for the AI-verdict tier (cheap and fast).
    pub eval_model: String,
    /// Global cap on simultaneously active workers (`SUPERVISOR_MAX_CONCURRENCY`).
    pub max_concurrency: u32,
    /// Worker wall-clock timeout (`SUPERVISOR_WORKER_TIMEOUT` seconds; default 3600).
    pub worker_timeout: Duration,
    /// `headless` or `tabby` (`SUPERVISOR_DISPATCH_MODE`).
    pub dispatch_mode: DispatchMode,
    /// Auto-create diagnostic subtasks for recoverable failures (`SUPERVISOR_SELF_HEAL`).
    pub self_heal: bool,
    /// Skip the review-triage stage and go straight to merging (`SUPERVISOR_SKIP_REVIEW_TRIAGE`).
    pub skip_review_triage: bool,
    /// Tag a tracker issue when adding tasks (`SUPERVISOR_AUTO_ISSUE`).
    pub auto_issue: bool,
    /// Staleness timeout for the pulse lock (`SUPERVISOR_PULSE_LOCK_TIMEOUT` seconds).
    pub pulse_lock_timeout: Duration,
    /// Resident-set limit before the pulse respawns itself (`SUPERVISOR_SELF_MEM_LIMIT` MB).
    pub self_mem_limit_mb: u64,
    /// Diagnostic subtasks allowed per parent task (config `max_diagnostics`).
    pub max_diagnostics: u32,
}

impl Config {
    /// Load config from env vars, `<data dir>/config`, and defaults.
    pub fn load() -> Result<Self> {
        Self::load_with_env(|k| env::var(k).ok())
    }

    /// Same as [`Config::load`] but with an injectable env lookup (tests).
    pub fn load_with_env(get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = get_env("AIDEVOPS_SUPERVISOR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let mut cfg = Self::defaults(&data_dir);

        // 1. Config file overrides.
        let config_file = data_dir.join("config");
        if config_file.exists() {
            parse_config_file(&config_file, |key, value| cfg.apply_file_entry(key, value))?;
        }

        // 2. Env overrides (env wins over file).
        cfg.apply_env_overrides(get_env);

        // eval_cli falls back to the worker CLI when never set.
        if cfg.eval_cli.is_empty() {
            cfg.eval_cli = cfg.worker_cli.clone();
        }
        Ok(cfg)
    }

    fn defaults(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            worker_cli: "claude".to_string(),
            default_model: "coding".to_string(),
            eval_cli: String::new(),
            eval_model: "fast".to_string(),
            max_concurrency: 8,
            worker_timeout: Duration::from_secs(3600),
            dispatch_mode: DispatchMode::Headless,
            self_heal: true,
            skip_review_triage: false,
            auto_issue: false,
            pulse_lock_timeout: Duration::from_secs(600),
            self_mem_limit_mb: 512,
            max_diagnostics: 1,
        }
    }

    fn apply_file_entry(&mut self, key: &str, value: &str) {
        match key {
            "worker_cli" => self.worker_cli = value.to_string(),
            "model" => self.default_model = value.to_string(),
            "eval_cli" => self.eval_cli = value.to_string(),
            "eval_model" => self.eval_model = value.to_string(),
            "max_concurrency" => {
                if let Ok(n) = value.parse() {
                    self.max_concurrency = n;
                }
            }
            "worker_timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.worker_timeout = Duration::from_secs(n);
                }
            }
            "dispatch_mode" => {
                if let Some(m) = DispatchMode::parse(value) {
                    self.dispatch_mode = m;
                }
            }
            "self_heal" => self.self_heal = value == "true",
            "skip_review_triage" => self.skip_review_triage = value == "true",
            "auto_issue" => self.auto_issue = value == "true",
            "pulse_lock_timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.pulse_lock_timeout = Duration::from_secs(n);
                }
            }
            "self_mem_limit" => {
                if let Ok(n) = value.parse() {
                    self.self_mem_limit_mb = n;
                }
            }
            "max_diagnostics" => {
                if let Ok(n) = value.parse() {
                    self.max_diagnostics = n;
                }
            }
            _ => {}
        }
    }

    fn apply_env_overrides(&mut self, get_env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get_env("SUPERVISOR_WORKER_CLI") {
            self.worker_cli = v;
        }
        if let Some(v) = get_env("SUPERVISOR_MODEL") {
            self.default_model = v;
        }
        if let Some(v) = get_env("SUPERVISOR_EVAL_CLI") {
            self.eval_cli = v;
        }
        if let Some(v) = get_env("SUPERVISOR_EVAL_MODEL") {
            self.eval_model = v;
        }
        if let Some(v) = get_env("SUPERVISOR_MAX_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.max_concurrency = n;
            }
        }
        if let Some(v) = get_env("SUPERVISOR_WORKER_TIMEOUT") {
            if let Ok(n) = v.parse::<u64>() {
                self.worker_timeout = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("SUPERVISOR_DISPATCH_MODE") {
            if let Some(m) = DispatchMode::parse(&v) {
                self.dispatch_mode = m;
            }
        }
        if let Some(v) = get_env("SUPERVISOR_SELF_HEAL") {
            self.self_heal = v == "true";
        }
        if let Some(v) = get_env("SUPERVISOR_SKIP_REVIEW_TRIAGE") {
            self.skip_review_triage = v == "true";
        }
        if let Some(v) = get_env("SUPERVISOR_AUTO_ISSUE") {
            self.auto_issue = v == "true";
        }
        if let Some(v) = get_env("SUPERVISOR_PULSE_LOCK_TIMEOUT") {
            if let Ok(n) = v.parse::<u64>() {
                self.pulse_lock_timeout = Duration::from_secs(n);
            }
        }
        if let Some(v) = get_env("SUPERVISOR_SELF_MEM_LIMIT") {
            if let Ok(n) = v.parse() {
                self.self_mem_limit_mb = n;
            }
        }
    }

    // ── Persisted layout ──────────────────────────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("supervisor.db")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.data_dir.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.data_dir.join("health")
    }

    pub fn pulse_lock_path(&self) -> PathBuf {
        self.data_dir.join("pulse.lock")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.ndjson")
    }

    pub fn resume_path(&self) -> PathBuf {
        self.data_dir.join("resume.json")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.data_dir.join("hooks")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn retros_dir(&self) -> PathBuf {
        self.data_dir.join("retros")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.data_dir.join("releases")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn orphan_scan_stamp(&self) -> PathBuf {
        self.data_dir.join("last-orphan-scan")
    }
}

fn default_data_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".aidevops").join("supervisor")
}

/// Parse a `key = value` config file, ignoring blank lines and `#` comments.
fn parse_config_file(path: &Path, mut apply: impl FnMut(&str, &str)) -> Result<()> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            apply(key.trim(), value.trim());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(env: &HashMap<String, String>) -> Config {
        Config::load_with_env(|k| env.get(k).cloned()).unwrap()
    }

    #[test]
    fn defaults_without_env_or_file() {
        let dir = TempDir::new().unwrap();
        let env = env_map(&[("AIDEVOPS_SUPERVISOR_DIR", dir.path().to_str().unwrap())]);
        let cfg = load(&env);
        assert_eq!(cfg.worker_cli, "claude");
        assert_eq!(cfg.eval_cli, "claude"); // falls back to worker_cli
        assert_eq!(cfg.max_concurrency, 8);
        assert_eq!(cfg.worker_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.dispatch_mode, DispatchMode::Headless);
        assert!(cfg.self_heal);
        assert_eq!(cfg.max_diagnostics, 1);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config"),
            "# comment\nworker_timeout = 120\neval_model = cheapest\nself_heal = false\n",
        )
        .unwrap();
        let env = env_map(&[("AIDEVOPS_SUPERVISOR_DIR", dir.path().to_str().unwrap())]);
        let cfg = load(&env);
        assert_eq!(cfg.worker_timeout, Duration::from_secs(120));
        assert_eq!(cfg.eval_model, "cheapest");
        assert!(!cfg.self_heal);
    }

    #[test]
    fn env_wins_over_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config"), "worker_timeout = 120\n").unwrap();
        let env = env_map(&[
            ("AIDEVOPS_SUPERVISOR_DIR", dir.path().to_str().unwrap()),
            ("SUPERVISOR_WORKER_TIMEOUT", "60"),
            ("SUPERVISOR_DISPATCH_MODE", "tabby"),
            ("SUPERVISOR_SKIP_REVIEW_TRIAGE", "true"),
        ]);
        let cfg = load(&env);
        assert_eq!(cfg.worker_timeout, Duration::from_secs(60));
        assert_eq!(cfg.dispatch_mode, DispatchMode::Tabby);
        assert!(cfg.skip_review_triage);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let dir = TempDir::new().unwrap();
        let env = env_map(&[
            ("AIDEVOPS_SUPERVISOR_DIR", dir.path().to_str().unwrap()),
            ("SUPERVISOR_MAX_CONCURRENCY", "lots"),
            ("SUPERVISOR_DISPATCH_MODE", "orbital"),
        ]);
        let cfg = load(&env);
        assert_eq!(cfg.max_concurrency, 8);
        assert_eq!(cfg.dispatch_mode, DispatchMode::Headless);
    }

    #[test]
    fn layout_paths_hang_off_data_dir() {
        let dir = TempDir::new().unwrap();
        let env = env_map(&[("AIDEVOPS_SUPERVISOR_DIR", dir.path().to_str().unwrap())]);
        let cfg = load(&env);
        assert_eq!(cfg.db_path(), dir.path().join("supervisor.db"));
        assert_eq!(cfg.pulse_lock_path(), dir.path().join("pulse.lock"));
        assert_eq!(cfg.pids_dir(), dir.path().join("pids"));
    }
}
