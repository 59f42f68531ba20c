//! Host load and memory sampling.
//!
//! Feature-detected at runtime: `/proc` when present (Linux), `sysctl` /
//! `vm_stat` otherwise (macOS). Parsers are pure so each platform's format
//! is unit-testable anywhere.

use std::fs;
use std::process::{Command, Stdio};

/// Coarse memory-pressure buckets derived from free-memory signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
}

impl MemoryPressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Medium => "medium",
            MemoryPressure::High => "high",
        }
    }
}

/// One observation of the host, taken at dispatch-gate time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSample {
    pub load_1m: f64,
    pub cpu_cores: u32,
    pub memory_pressure: MemoryPressure,
}

impl SystemSample {
    /// 1-minute load as a percentage of core count (100 = one busy core per core).
    pub fn load_ratio(&self) -> f64 {
        if self.cpu_cores == 0 {
            return 0.0;
        }
        self.load_1m / self.cpu_cores as f64 * 100.0
    }
}

/// Take a fresh sample. Every probe is best-effort; failures degrade to a
/// calm reading rather than blocking dispatch.
pub fn sample() -> SystemSample {
    SystemSample {
        load_1m: read_load_1m().unwrap_or(0.0),
        cpu_cores: cpu_cores(),
        memory_pressure: read_memory_pressure().unwrap_or(MemoryPressure::Low),
    }
}

pub fn cpu_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn read_load_1m() -> Option<f64> {
    if let Ok(content) = fs::read_to_string("/proc/loadavg") {
        return parse_proc_loadavg(&content);
    }
    // macOS: `sysctl -n vm.loadavg` prints `{ 1.23 1.11 1.05 }`.
    let out = Command::new("sysctl")
        .args(["-n", "vm.loadavg"])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    parse_sysctl_loadavg(&String::from_utf8_lossy(&out.stdout))
}

pub fn parse_proc_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

pub fn parse_sysctl_loadavg(content: &str) -> Option<f64> {
    content
        .trim()
        .trim_start_matches('{')
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn read_memory_pressure() -> Option<MemoryPressure> {
    if let Ok(content) = fs::read_to_string("/proc/meminfo") {
        return parse_meminfo_pressure(&content);
    }
    let total = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .stderr(Stdio::null())
        .output()
        .ok()
        .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<u64>().ok())?;
    let vm_stat = Command::new("vm_stat").stderr(Stdio::null()).output().ok()?;
    parse_vm_stat_pressure(&String::from_utf8_lossy(&vm_stat.stdout), total)
}

/// Bucket by available-to-total ratio: under 10% free is high pressure,
/// under 25% is medium.
fn bucket(available: u64, total: u64) -> MemoryPressure {
    if total == 0 {
        return MemoryPressure::Low;
    }
    let pct = available as f64 / total as f64 * 100.0;
    if pct < 10.0 {
        MemoryPressure::High
    } else if pct < 25.0 {
        MemoryPressure::Medium
    } else {
        MemoryPressure::Low
    }
}

pub fn parse_meminfo_pressure(content: &str) -> Option<MemoryPressure> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    // MemAvailable is absent on very old kernels; fall back to MemFree.
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some(bucket(available, total))
}

pub fn parse_vm_stat_pressure(content: &str, total_bytes: u64) -> Option<MemoryPressure> {
    let page_size: u64 = content
        .lines()
        .next()
        .and_then(|l| l.split("page size of").nth(1))
        .and_then(|s| s.trim().split_whitespace().next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(4096);

    let pages = |name: &str| -> u64 {
        content
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.rsplit_once(':'))
            .and_then(|(_, v)| v.trim().trim_end_matches('.').parse().ok())
            .unwrap_or(0)
    };
    let available = (pages("Pages free") + pages("Pages inactive")) * page_size;
    Some(bucket(available, total_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_loadavg_first_field() {
        assert_eq!(parse_proc_loadavg("9.50 4.21 2.02 3/412 12345\n"), Some(9.5));
        assert_eq!(parse_proc_loadavg(""), None);
    }

    #[test]
    fn sysctl_loadavg_braced_format() {
        assert_eq!(parse_sysctl_loadavg("{ 1.23 1.11 1.05 }\n"), Some(1.23));
    }

    #[test]
    fn meminfo_buckets() {
        let meminfo = |avail: u64| format!("MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:   {avail} kB\n");
        assert_eq!(
            parse_meminfo_pressure(&meminfo(8_000_000)),
            Some(MemoryPressure::Low)
        );
        assert_eq!(
            parse_meminfo_pressure(&meminfo(3_000_000)),
            Some(MemoryPressure::Medium)
        );
        assert_eq!(
            parse_meminfo_pressure(&meminfo(800_000)),
            Some(MemoryPressure::High)
        );
    }

    #[test]
    fn meminfo_falls_back_to_memfree() {
        let content = "MemTotal:       8000000 kB\nMemFree:        4000000 kB\n";
        assert_eq!(parse_meminfo_pressure(content), Some(MemoryPressure::Low));
    }

    #[test]
    fn vm_stat_counts_free_plus_inactive() {
        let content = "Mach Virtual Memory Statistics: (page size of 16384 bytes)\n\
                       Pages free:                               100000.\n\
                       Pages active:                             400000.\n\
                       Pages inactive:                           100000.\n";
        // (100000 + 100000) * 16384 = ~3.3 GB available of 8 GB → ~41% → low.
        assert_eq!(
            parse_vm_stat_pressure(content, 8_000_000_000),
            Some(MemoryPressure::Low)
        );
        // Of 64 GB → ~5% → high.
        assert_eq!(
            parse_vm_stat_pressure(content, 64_000_000_000),
            Some(MemoryPressure::High)
        );
    }

    #[test]
    fn load_ratio_per_core() {
        let s = SystemSample {
            load_1m: 9.5,
            cpu_cores: 4,
            memory_pressure: MemoryPressure::Low,
        };
        assert!((s.load_ratio() - 237.5).abs() < f64::EPSILON);
    }

    #[test]
    fn live_sample_is_sane() {
        let s = sample();
        assert!(s.cpu_cores >= 1);
        assert!(s.load_1m >= 0.0);
    }
}
