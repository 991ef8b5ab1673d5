use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::utils::fs::lock_sibling;

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Advisory cross-process lock at `<target>.lock`.
///
/// The lock file holds one line, `<RFC3339 timestamp> <pid>`. Acquisition is
/// exclusive-create; on contention the holder's pid is probed with signal 0
/// and a dead holder (or an unparseable file) is treated as stale and swept.
/// Dropping the guard removes the file, best-effort.
pub struct PathLock {
    lock_path: PathBuf,
}

impl PathLock {
    pub fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_sibling(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    writeln!(
                        file,
                        "{} {}",
                        chrono::Utc::now().to_rfc3339(),
                        std::process::id()
                    )
                    .with_context(|| format!("Failed to write {}", lock_path.display()))?;
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if holder_is_dead(&lock_path) {
                        log::debug!("removing stale lock {}", lock_path.display());
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", lock_path.display()));
                }
            }
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        // A concurrent cleaner may already have removed it.
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn holder_is_dead(lock_path: &Path) -> bool {
    let content = match fs::read_to_string(lock_path) {
        Ok(c) => c,
        // Racing removal: re-enter the create loop.
        Err(_) => return false,
    };
    let pid = match content.split_whitespace().nth(1).and_then(|p| p.parse::<i32>().ok()) {
        Some(p) => p,
        // Corrupt lock file counts as stale.
        None => return true,
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => false,
        Err(nix::errno::Errno::EPERM) => false,
        Err(_) => true,
    }
}

/// True iff `path` exists and, for a positive `ttl`, its mtime is younger
/// than `ttl`.
pub fn is_fresh(path: &Path, ttl: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if ttl.is_zero() {
        return true;
    }
    match meta.modified().map(|m| SystemTime::now().duration_since(m)) {
        Ok(Ok(age)) => age < ttl,
        _ => false,
    }
}

/// Runs `produce` at most once across cooperating processes: the lock holder
/// produces `target`, everyone else observes the finished file.
pub fn ensure(target: &Path, ttl: Duration, produce: impl FnOnce() -> Result<()>) -> Result<()> {
    if is_fresh(target, ttl) {
        return Ok(());
    }
    let _lock = PathLock::acquire(target)?;
    if is_fresh(target, ttl) {
        return Ok(());
    }
    produce()
}
