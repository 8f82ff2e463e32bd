//! Named cross-process locks backed by advisory file locks.
//!
//! `acquire` opens `{dir}/{name}.lock` and polls an exclusive non-blocking
//! lock until it succeeds. There is no timeout. The returned [`LockGuard`]
//! unlocks when dropped, so every exit path releases the lock.
//!
//! Locks are held per open file, not per process: a task that acquires a
//! name it already holds waits on itself forever.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Guards node readiness transitions and pending annotations.
pub const NODE_ASSIGNMENT_LOCK: &str = "node-assignment";

/// Guards the proposal queue. Taken before [`NODE_ASSIGNMENT_LOCK`] when
/// both are needed, never after it.
pub const QUEUE_LOCK: &str = "queue";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to lock {name}: {source}")]
    Lock { name: String, source: io::Error },
}

/// Hands out named locks rooted in one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    /// Block (asynchronously) until the named lock is held.
    pub async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let file = self.open(name)?;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            trace!(lock = name, attempt, "attempting lock");
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(source) => {
                    return Err(LockError::Lock {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
        debug!(lock = name, attempts = attempt, "lock acquired");
        Ok(LockGuard {
            name: name.to_string(),
            file,
        })
    }

    /// Take the lock only if it is free right now.
    #[cfg(test)]
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let file = self.open(name)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(LockGuard {
                name: name.to_string(),
                file,
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(source) => Err(LockError::Lock {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn open(&self, name: &str) -> Result<File, LockError> {
        let path = self.dir.join(format!("{name}.lock"));
        std::fs::create_dir_all(&self.dir).map_err(|source| LockError::Open {
            path: path.clone(),
            source,
        })?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open { path, source })
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// A held lock. Dropping it unlocks and closes the file.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    file: File,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.name, error = %e, "failed to release lock");
        } else {
            debug!(lock = %self.name, "lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire(QUEUE_LOCK).await.unwrap();
        assert_eq!(guard.name(), "queue");
        assert!(dir.path().join("queue.lock").exists());
    }

    #[tokio::test]
    async fn held_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire(QUEUE_LOCK).await.unwrap();
        assert!(locks.try_acquire(QUEUE_LOCK).unwrap().is_none());
        // A different name is independent.
        assert!(locks.try_acquire(NODE_ASSIGNMENT_LOCK).unwrap().is_some());

        drop(guard);
        assert!(locks.try_acquire(QUEUE_LOCK).unwrap().is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        let released = Arc::new(AtomicBool::new(false));

        let guard = locks.acquire(NODE_ASSIGNMENT_LOCK).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                let _g = locks.acquire(NODE_ASSIGNMENT_LOCK).await.unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.await.unwrap(), "waiter got the lock before release");
    }

    #[tokio::test]
    async fn lock_released_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        async fn failing(locks: &LockManager) -> Result<(), &'static str> {
            let _guard = locks.acquire(QUEUE_LOCK).await.map_err(|_| "lock")?;
            Err("boom")
        }

        assert!(failing(&locks).await.is_err());
        assert!(locks.try_acquire(QUEUE_LOCK).unwrap().is_some());
    }
}
