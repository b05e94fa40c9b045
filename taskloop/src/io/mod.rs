//! I/O adapters: filesystem state, git, subprocesses and task files.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

pub mod agent;
pub mod changes;
pub mod config;
pub mod gates;
pub mod git;
pub mod iteration_log;
pub mod notify;
pub mod paths;
pub mod process;
pub mod run_state;
pub mod task_source;
pub mod workspace;

/// Replace `path` with `contents` via a temp file in the same directory.
///
/// Readers see either the old document or the new one, never a torn write.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// A lock older than this was left by a dead process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Exclusive marker file guarding a read-modify-write; removed on drop.
pub(crate) struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(path) && break_stale(path) {
                        continue;
                    }
                    if started.elapsed() >= LOCK_TIMEOUT {
                        bail!("timed out waiting for lock {}", path.display());
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock");
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= STALE_LOCK_AGE)
}

/// Remove the stale lock at `path`; true if this caller removed it.
///
/// Waiters race to break a stale lock. Only the holder of the `.break`
/// marker may remove it, and only after seeing it stale again, so a lock
/// freshly taken by another waiter is never deleted.
fn break_stale(path: &Path) -> bool {
    let mut marker = path.as_os_str().to_owned();
    marker.push(".break");
    let marker = PathBuf::from(marker);

    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => {
            let removed = is_stale(path) && fs::remove_file(path).is_ok();
            if removed {
                warn!(path = %path.display(), "removed stale lock");
            }
            if let Err(err) = fs::remove_file(&marker) {
                warn!(path = %marker.display(), err = %err, "failed to remove break marker");
            }
            removed
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            // Left behind by a waiter that died mid-break.
            if is_stale(&marker) {
                let _ = fs::remove_file(&marker);
            }
            false
        }
        Err(err) => {
            debug!(path = %marker.display(), err = %err, "cannot create break marker");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn age(path: &Path, by: Duration) {
        File::options()
            .write(true)
            .open(path)
            .expect("open")
            .set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    #[test]
    fn lock_is_exclusive_and_removed_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");
        {
            let _held = FileLock::acquire(&path).expect("acquire");
            assert!(path.is_file());
            assert!(OpenOptions::new().write(true).create_new(true).open(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");
        fs::write(&path, "").expect("seed");
        age(&path, STALE_LOCK_AGE + Duration::from_secs(5));

        let held = FileLock::acquire(&path).expect("acquire");
        assert!(!is_stale(&path));
        assert!(!temp.path().join("state.json.lock.break").exists());
        drop(held);
    }

    #[test]
    fn fresh_lock_is_not_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");
        fs::write(&path, "").expect("seed");
        assert!(!break_stale(&path));
        assert!(path.exists());
    }

    #[test]
    fn waiters_racing_on_a_stale_lock_hold_it_one_at_a_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");
        fs::write(&path, "").expect("seed");
        age(&path, STALE_LOCK_AGE + Duration::from_secs(5));

        let holders = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let holders = Arc::clone(&holders);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    let _lock = FileLock::acquire(&path).expect("acquire");
                    if holders.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!path.exists());
    }
}
