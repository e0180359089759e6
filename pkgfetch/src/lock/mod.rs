//! Cross-process file locks for shared cache files.
//!
//! Every shared cache file is protected by a named lock so that finalizing a
//! cache file in one process and reading it in another are totally ordered.
//! The lock for a path is an OS advisory lock on a small lock file stored
//! under a dedicated lock directory; the lock file name is the SHA-256 of the
//! protected path, so any process using the same lock directory agrees on it.
//!
//! Acquisition is scoped: [`FileLockManager::acquire`] returns a
//! [`FileLockGuard`] that releases the lock when dropped, which covers early
//! returns, errors and cancellation. If the process dies the OS drops the
//! lock with the file handle.
//!
//! Lock files do not accumulate. On Unix the guard unlinks its lock file
//! while still holding the lock, and [`FileLockManager::prune_unused`] removes
//! files left behind by crashed processes. An acquirer that locks a file
//! which has since been unlinked notices that the path no longer names its
//! handle and starts over with a fresh file.
//!
//! File system calls run on the blocking pool, never on the async executor.
//!
//! # Example
//!
//! ```ignore
//! use pkgfetch::lock::FileLockManager;
//!
//! let locks = FileLockManager::new(lock_dir);
//! let guard = locks.acquire(&cache_file, &cancel).await?;
//! // ... read or replace cache_file ...
//! drop(guard);
//! ```

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time to wait for a contended lock (2 minutes).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Default delay between acquisition attempts on a contended lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors that can occur while acquiring a file lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was still held by someone else when the timeout elapsed.
    #[error("timed out after {waited_ms}ms waiting for lock on {}", path.display())]
    Timeout { path: PathBuf, waited_ms: u64 },

    /// The caller's cancellation token fired while waiting.
    #[error("cancelled while waiting for lock on {}", path.display())]
    Cancelled { path: PathBuf },

    /// The lock file could not be created or locked.
    #[error("failed to lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Creates named, cross-process locks keyed by file path.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    lock_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileLockManager {
    /// Create a lock manager storing its lock files in `lock_dir`.
    pub fn new(lock_dir: PathBuf) -> Self {
        Self {
            lock_dir,
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the maximum time to wait for a contended lock.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between acquisition attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Directory holding the lock files.
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Returns the lock file used to protect `path`.
    pub fn lock_file_for(&self, path: &Path) -> PathBuf {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        self.lock_dir.join(format!("{:x}.lock", digest))
    }

    /// Acquire the lock for `path`, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`LockError::Cancelled`] if `cancel` fires while waiting
    /// - [`LockError::Timeout`] if the lock stays contended past the timeout
    /// - [`LockError::Io`] if the lock file cannot be opened or locked
    pub async fn acquire(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FileLockGuard, LockError> {
        let lock_path = self.lock_file_for(path);
        let io_error = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let start = Instant::now();
        let mut reported = false;
        let mut opened: Option<File> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled {
                    path: path.to_path_buf(),
                });
            }

            let lock_dir = self.lock_dir.clone();
            let candidate = lock_path.clone();
            let file = opened.take();
            let attempt =
                tokio::task::spawn_blocking(move || try_lock(&lock_dir, &candidate, file))
                    .await
                    .map_err(|e| io_error(io::Error::new(io::ErrorKind::Other, e)))?
                    .map_err(io_error)?;

            match attempt {
                Attempt::Acquired(file) => {
                    return Ok(FileLockGuard {
                        file,
                        path: path.to_path_buf(),
                        lock_path,
                    });
                }
                Attempt::Replaced => {
                    debug!(path = %path.display(), "Lock file was replaced while waiting, reopening");
                    continue;
                }
                Attempt::Contended(file) => opened = Some(file),
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                warn!(
                    path = %path.display(),
                    waited_ms = waited.as_millis() as u64,
                    "Gave up waiting for cache file lock"
                );
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            if !reported {
                debug!(path = %path.display(), "Cache file lock contended, waiting");
                reported = true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(LockError::Cancelled {
                        path: path.to_path_buf(),
                    });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Run `body` while holding the lock for `path`.
    ///
    /// The lock is released when `body` completes, fails, or is dropped.
    pub async fn with_lock<T, F, Fut>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(path, cancel).await?;
        Ok(body().await)
    }

    /// Remove lock files nobody holds.
    ///
    /// Each file is locked before it is unlinked, so a file in use is left
    /// alone. Returns the number of files removed. Only Unix allows the
    /// unlink-then-reopen handshake; elsewhere nothing is removed.
    pub fn prune_unused(&self) -> io::Result<usize> {
        if cfg!(not(unix)) {
            return Ok(0);
        }

        let read_dir = match fs::read_dir(&self.lock_dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in read_dir {
            let lock_path = entry?.path();
            if lock_path.extension().map_or(true, |ext| ext != "lock") {
                continue;
            }

            let file = match OpenOptions::new().write(true).open(&lock_path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(e) if is_contended(&e) => continue,
                Err(e) => return Err(e),
            }

            match fs::remove_file(&lock_path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %lock_path.display(), error = %e, "Failed to remove unused lock file");
                }
            }
        }

        debug!(lock_dir = %self.lock_dir.display(), removed, "Pruned unused lock files");
        Ok(removed)
    }
}

/// Result of one non-blocking acquisition attempt.
enum Attempt {
    Acquired(File),
    /// Someone else holds the lock; keep the handle for the next poll.
    Contended(File),
    /// The locked file is no longer the one at the lock path.
    Replaced,
}

/// Open the lock file if needed and try to lock it once. Blocking.
fn try_lock(lock_dir: &Path, lock_path: &Path, file: Option<File>) -> io::Result<Attempt> {
    let file = match file {
        Some(file) => file,
        None => {
            fs::create_dir_all(lock_dir)?;
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(lock_path)?
        }
    };

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) if is_current(&file, lock_path)? => Ok(Attempt::Acquired(file)),
        // Closing the handle releases the lock on the unlinked file.
        Ok(()) => Ok(Attempt::Replaced),
        Err(e) if is_contended(&e) => Ok(Attempt::Contended(file)),
        Err(e) => Err(e),
    }
}

/// True if `lock_path` still names the file behind `file`.
#[cfg(unix)]
fn is_current(file: &File, lock_path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(lock_path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Open files cannot be unlinked here, so an open handle is always current.
#[cfg(not(unix))]
fn is_current(_file: &File, _lock_path: &Path) -> io::Result<bool> {
    Ok(true)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Holds a cross-process file lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileLockGuard {
    /// The path this guard protects.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Unlink while still locked; waiters on the old file will reopen.
        #[cfg(unix)]
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.lock_path.display(), error = %e, "Failed to remove lock file");
            }
        }

        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the handle releases the lock anyway.
            warn!(path = %self.path.display(), error = %e, "Failed to release cache file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> FileLockManager {
        FileLockManager::new(dir.path().join("locks"))
            .with_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_lock_file_name_is_stable() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let a = locks.lock_file_for(Path::new("/cache/a.dat"));
        let b = locks.lock_file_for(Path::new("/cache/a.dat"));
        let c = locks.lock_file_for(Path::new("/cache/b.dat"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(locks.lock_dir()));
        assert_eq!(a.extension().unwrap(), "lock");
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");

        let guard = locks.acquire(&target, &cancel).await.unwrap();
        assert_eq!(guard.path(), target.as_path());
        drop(guard);

        // Released: can be taken again immediately
        let again = locks.acquire(&target, &cancel).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");

        let _held = locks.acquire(&target, &cancel).await.unwrap();
        let result = locks.acquire(&target, &cancel).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unrelated_paths_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();

        let _a = locks.acquire(&dir.path().join("a.dat"), &cancel).await.unwrap();
        let b = locks.acquire(&dir.path().join("b.dat"), &cancel).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir).with_timeout(Duration::from_secs(30));
        let target = dir.path().join("a.dat");

        let _held = locks
            .acquire(&target, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = locks.acquire(&target, &cancel).await;
        assert!(matches!(result, Err(LockError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir).with_timeout(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");

        let held = locks.acquire(&target, &cancel).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let target = target.clone();
            tokio::spawn(async move {
                locks
                    .acquire(&target, &CancellationToken::new())
                    .await
                    .map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");
        let lock_file = locks.lock_file_for(&target);

        let guard = locks.acquire(&target, &cancel).await.unwrap();
        assert!(lock_file.exists());
        drop(guard);

        assert!(!lock_file.exists());
        assert_eq!(fs::read_dir(locks.lock_dir()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_waiter_on_unlinked_file_reopens() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir).with_timeout(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");

        let held = locks.acquire(&target, &cancel).await.unwrap();

        // The waiter opens the current lock file and polls on it.
        let waiter = {
            let locks = Arc::clone(&locks);
            let target = target.clone();
            tokio::spawn(async move { locks.acquire(&target, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        let guard = waiter.await.unwrap().unwrap();
        assert!(locks.lock_file_for(&target).exists());

        // The waiter's lock is on the live file, so it excludes newcomers.
        let contender = manager(&dir).acquire(&target, &cancel).await;
        assert!(matches!(contender, Err(LockError::Timeout { .. })));
        drop(guard);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prune_removes_only_unused_lock_files() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();

        fs::create_dir_all(locks.lock_dir()).unwrap();
        let stale = locks.lock_file_for(Path::new("/cache/crashed.dat"));
        fs::write(&stale, b"").unwrap();
        let unrelated = locks.lock_dir().join("notes.txt");
        fs::write(&unrelated, b"").unwrap();

        let target = dir.path().join("a.dat");
        let _held = locks.acquire(&target, &cancel).await.unwrap();

        assert_eq!(locks.prune_unused().unwrap(), 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(locks.lock_file_for(&target).exists());
    }

    #[test]
    fn test_prune_missing_dir() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockManager::new(dir.path().join("never-created"));
        assert_eq!(locks.prune_unused().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_with_lock_runs_body() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let cancel = CancellationToken::new();
        let target = dir.path().join("a.dat");

        let value = locks
            .with_lock(&target, &cancel, || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // Lock released after the body
        assert!(locks.acquire(&target, &cancel).await.is_ok());
    }
}
