//! Persistent, content-addressed package store.
//!
//! The store keeps one canonical copy of every package archive it has seen,
//! addressed by [`ArtifactIdentity`]. The download resolver checks it before
//! touching the network and hands new downloads to it for placement.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! └── packagea/
//!     └── 1.0.0-beta/
//!         ├── packagea.1.0.0-beta.nupkg
//!         └── packagea.1.0.0-beta.nupkg.sha256   ◄── written last
//! ```
//!
//! The `.sha256` marker is the completion flag: a package without it is
//! treated as absent, so a crash mid-write never exposes a partial archive.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::identity::ArtifactIdentity;
use crate::lock::{FileLockManager, LockError};
use crate::source::{BoxFuture, ByteStream};
use crate::stream::ArtifactStream;

/// Buffer size for copying incoming archives (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Errors that can occur while reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading the incoming package stream failed.
    #[error("failed to read package stream: {source}")]
    Read {
        #[source]
        source: io::Error,
    },

    /// Writing into the store failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Opening a stored package failed.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The package file lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The caller's cancellation token fired.
    #[error("store operation cancelled")]
    Cancelled,
}

/// A persistent artifact store keyed by full identity.
pub trait PersistentStore: Send + Sync {
    /// Open the stored artifact for `identity`, if present.
    fn try_get<'a>(
        &'a self,
        identity: &'a ArtifactIdentity,
    ) -> BoxFuture<'a, Result<Option<ArtifactStream>, StoreError>>;

    /// Place `stream` in the store and return a stream over the canonical copy.
    fn put<'a>(
        &'a self,
        identity: &'a ArtifactIdentity,
        stream: ByteStream,
        source: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ArtifactStream, StoreError>>;
}

/// The global packages folder.
#[derive(Debug, Clone)]
pub struct GlobalPackageStore {
    root: PathBuf,
    locks: FileLockManager,
}

impl GlobalPackageStore {
    /// Create a store rooted at `root`. Package finalization uses `locks`.
    pub fn new(root: PathBuf, locks: FileLockManager) -> Self {
        Self { root, locks }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a single package version.
    pub fn package_dir(&self, identity: &ArtifactIdentity) -> PathBuf {
        self.root
            .join(identity.name().to_lowercase())
            .join(identity.normalized_version().to_lowercase())
    }

    /// Path of the stored archive.
    pub fn archive_path(&self, identity: &ArtifactIdentity) -> PathBuf {
        self.package_dir(identity)
            .join(format!("{}.nupkg", file_stem(identity)))
    }

    /// Path of the completion marker holding the archive's SHA-256.
    pub fn marker_path(&self, identity: &ArtifactIdentity) -> PathBuf {
        self.package_dir(identity)
            .join(format!("{}.nupkg.sha256", file_stem(identity)))
    }

    async fn open_existing(
        &self,
        identity: &ArtifactIdentity,
    ) -> Result<Option<ArtifactStream>, StoreError> {
        let marker = self.marker_path(identity);
        if !fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(None);
        }

        let archive = self.archive_path(identity);
        match File::open(&archive).await {
            Ok(file) => Ok(Some(ArtifactStream::stored(
                file,
                self.root.display().to_string(),
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Open {
                path: archive,
                source: e,
            }),
        }
    }

    async fn write_package(
        &self,
        identity: &ArtifactIdentity,
        mut stream: ByteStream,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactStream, StoreError> {
        if let Some(existing) = self.open_existing(identity).await? {
            debug!(package = %identity, "Package already in store");
            return Ok(existing);
        }

        let dir = self.package_dir(identity);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Write {
                path: dir.clone(),
                source: e,
            })?;

        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| StoreError::Write { path, source }
        };

        // Stage in the package directory so the final rename stays on one filesystem
        let staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_stem(identity)))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(write_err(&dir))?;
        let (std_file, staged_path) = staged.into_parts();
        let mut file = File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                read = stream.read(&mut buffer) => read.map_err(|e| StoreError::Read { source: e })?,
            };
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read])
                .await
                .map_err(write_err(&staged_path))?;
        }
        file.flush().await.map_err(write_err(&staged_path))?;
        file.sync_all().await.map_err(write_err(&staged_path))?;
        drop(file);

        let archive = self.archive_path(identity);
        let marker = self.marker_path(identity);
        let digest = format!("{:x}", hasher.finalize());

        let guard = self.locks.acquire(&archive, cancel).await?;
        if fs::try_exists(&marker).await.unwrap_or(false) {
            // Another writer finished first; the staged copy is dropped
            debug!(package = %identity, "Package was stored concurrently");
        } else {
            staged_path
                .persist(&archive)
                .map_err(|e| StoreError::Write {
                    path: archive.clone(),
                    source: e.error,
                })?;
            fs::write(&marker, digest.as_bytes())
                .await
                .map_err(write_err(&marker))?;
            info!(package = %identity, source, "Added package to store");
        }
        drop(guard);

        let file = File::open(&archive)
            .await
            .map_err(|e| StoreError::Open {
                path: archive.clone(),
                source: e,
            })?;
        Ok(ArtifactStream::stored(file, source))
    }
}

fn file_stem(identity: &ArtifactIdentity) -> String {
    format!(
        "{}.{}",
        identity.name().to_lowercase(),
        identity.normalized_version().to_lowercase()
    )
}

impl PersistentStore for GlobalPackageStore {
    fn try_get<'a>(
        &'a self,
        identity: &'a ArtifactIdentity,
    ) -> BoxFuture<'a, Result<Option<ArtifactStream>, StoreError>> {
        Box::pin(self.open_existing(identity))
    }

    fn put<'a>(
        &'a self,
        identity: &'a ArtifactIdentity,
        stream: ByteStream,
        source: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ArtifactStream, StoreError>> {
        Box::pin(self.write_package(identity, stream, source, cancel))
    }
}
