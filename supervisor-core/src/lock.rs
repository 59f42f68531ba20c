//! Pulse mutex.
//!
//! Guarantees at most one pulse runs at a time across all invocation sources
//! (cron, manual, file-watch). Uses a directory at `<data dir>/pulse.lock` —
//! `mkdir` is atomic on every filesystem we care about — holding an `owner`
//! file with the holder's PID.
//!
//! Stale locks are reclaimed when the owner PID is dead OR the lock is older
//! than the configured staleness timeout. The lock deliberately survives the
//! supervisor's own respawn: the respawned pulse re-acquires by PID.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::proc::is_pid_alive;

/// Outcome of a lock attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// Lock acquired; the guard releases it on drop.
    Acquired(PulseLock),
    /// Another live pulse holds the lock.
    Busy { holder_pid: u32 },
}

/// RAII guard for the pulse lock directory.
#[derive(Debug, PartialEq, Eq)]
pub struct PulseLock {
    path: PathBuf,
}

impl PulseLock {
    /// Try to take the lock at `path`, reclaiming stale holders.
    pub fn acquire(path: &Path, staleness: Duration) -> Result<LockAttempt> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match fs::create_dir(path) {
                Ok(()) => {
                    fs::write(path.join("owner"), format!("{}\n", std::process::id()))
                        .context("writing pulse lock owner")?;
                    return Ok(LockAttempt::Acquired(PulseLock {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match holder_state(path, staleness)? {
                        Holder::Live(pid) => return Ok(LockAttempt::Busy { holder_pid: pid }),
                        Holder::Stale => {
                            // Dead owner or expired lock: reclaim and retry once.
                            let _ = fs::remove_file(path.join("owner"));
                            let _ = fs::remove_dir(path);
                        }
                    }
                }
                Err(e) => return Err(e).context("creating pulse lock"),
            }
        }
        // A competing pulse re-created the lock between our reclaim and retry.
        match holder_state(path, staleness)? {
            Holder::Live(pid) => Ok(LockAttempt::Busy { holder_pid: pid }),
            Holder::Stale => Ok(LockAttempt::Busy { holder_pid: 0 }),
        }
    }
}

impl Drop for PulseLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.join("owner"));
        let _ = fs::remove_dir(&self.path);
    }
}

enum Holder {
    Live(u32),
    Stale,
}

fn holder_state(path: &Path, staleness: Duration) -> Result<Holder> {
    let owner_pid: Option<u32> = fs::read_to_string(path.join("owner"))
        .ok()
        .and_then(|s| s.trim().parse().ok());

    let age = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok());

    match owner_pid {
        Some(pid) if is_pid_alive(pid) => {
            if age.is_some_and(|a| a > staleness) {
                // Owner is alive but has held the lock past the timeout —
                // treat as hung and reclaim.
                Ok(Holder::Stale)
            } else {
                Ok(Holder::Live(pid))
            }
        }
        // No readable owner yet: the holder may be between mkdir and the
        // owner write. Only age decides.
        None if age.is_some_and(|a| a < staleness) => Ok(Holder::Live(0)),
        _ => Ok(Holder::Stale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(600);

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.lock");

        let attempt = PulseLock::acquire(&path, STALE).unwrap();
        let LockAttempt::Acquired(guard) = attempt else {
            panic!("expected acquisition");
        };
        assert!(path.is_dir());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_sees_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.lock");

        let _guard = match PulseLock::acquire(&path, STALE).unwrap() {
            LockAttempt::Acquired(g) => g,
            LockAttempt::Busy { .. } => panic!("first acquire must succeed"),
        };

        match PulseLock::acquire(&path, STALE).unwrap() {
            LockAttempt::Busy { holder_pid } => assert_eq!(holder_pid, std::process::id()),
            LockAttempt::Acquired(_) => panic!("lock must be held"),
        }
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.lock");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("owner"), "3999999\n").unwrap();

        match PulseLock::acquire(&path, STALE).unwrap() {
            LockAttempt::Acquired(_) => {}
            LockAttempt::Busy { .. } => panic!("dead owner must be reclaimed"),
        }
    }

    #[test]
    fn unreadable_owner_with_fresh_lock_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.lock");
        fs::create_dir(&path).unwrap();
        // No owner file: holder may still be mid-acquisition.

        match PulseLock::acquire(&path, STALE).unwrap() {
            LockAttempt::Busy { holder_pid } => assert_eq!(holder_pid, 0),
            LockAttempt::Acquired(_) => panic!("fresh ownerless lock must not be stolen"),
        }
    }

    #[test]
    fn expired_lock_reclaimed_even_with_live_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.lock");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("owner"), format!("{}\n", std::process::id())).unwrap();

        // Zero staleness: every lock is immediately expired.
        match PulseLock::acquire(&path, Duration::ZERO).unwrap() {
            LockAttempt::Acquired(_) => {}
            LockAttempt::Busy { .. } => panic!("expired lock must be reclaimed"),
        }
    }
}
