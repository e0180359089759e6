//! Delivers a fetch outcome's bytes to the caller's destination.

use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::FetchError;
use super::outcome::FetchOutcome;
use crate::lock::FileLockManager;
use crate::stream::copy_until_cancelled;

/// Copies shared cache files to destinations under the cache file lock.
///
/// The lock is the same named lock the source takes when it finalizes a cache
/// file, so a reader never opens a file that is being replaced or deleted.
#[derive(Debug, Clone)]
pub struct ArtifactCopier {
    locks: FileLockManager,
}

impl ArtifactCopier {
    /// Create a copier using `locks` for cache file locking.
    pub fn new(locks: FileLockManager) -> Self {
        Self { locks }
    }

    /// Deliver the bytes for `outcome` into `destination`.
    ///
    /// Returns true if bytes were delivered, either now or during the fetch.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if `cancel` fires while waiting for the
    ///   lock or copying
    /// - [`FetchError::Lock`] if the cache file lock cannot be taken
    /// - [`FetchError::CopyFailed`] if the cache file cannot be read or the
    ///   destination cannot be written
    pub async fn deliver<W>(
        &self,
        outcome: &FetchOutcome,
        destination: &mut W,
        cancel: &CancellationToken,
    ) -> Result<bool, FetchError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = match outcome {
            FetchOutcome::StreamConsumed { bytes_copied } => return Ok(*bytes_copied),
            FetchOutcome::NotFound | FetchOutcome::Exhausted | FetchOutcome::Cancelled => {
                return Ok(false)
            }
            FetchOutcome::CacheFile { path } => path,
        };

        let _guard = self.locks.acquire(path, cancel).await?;

        let copy_failed = |source| FetchError::CopyFailed {
            path: path.clone(),
            source,
        };
        let mut file = open_shared_read(path).await.map_err(copy_failed)?;

        match copy_until_cancelled(&mut file, destination, cancel).await {
            Some(Ok(copied)) => {
                debug!(path = %path.display(), bytes = copied, "Copied cache file to destination");
                Ok(true)
            }
            Some(Err(e)) => Err(copy_failed(e)),
            None => Err(FetchError::Cancelled),
        }
    }
}

/// Open a cache file for reading while other processes may read or delete it.
async fn open_shared_read(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);

    #[cfg(windows)]
    {
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }

    options.open(path).await
}
