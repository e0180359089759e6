//! Resolves one fully identified package to a readable stream.
//!
//! The resolver serves the "give me this exact package" path. It does not use
//! the coalescer. Instead, store-bound downloads of one identity are
//! serialized in-process behind a per-identity gate, and the store is checked
//! again once the gate is held, so concurrent callers share one download.
//! Across processes the store's idempotent `put` keeps a single copy.
//!
//! ```text
//! resolve(identity, url)
//!     │
//!     ├─► store.try_get ── hit ──► Available(store stream)     (no network)
//!     │
//!     ├─► [shared only] identity gate ─► store.try_get again
//!     │
//!     └─► open_stream (≤ 3 attempts)
//!             ├── None ──────────────► NotFound
//!             ├── direct download ───► Available(ephemeral file)
//!             └── otherwise ─────────► store.put ──► Available(store stream)
//! ```
//!
//! Only socket failures and timeouts are retried. Any other failure is
//! reported once as [`FetchError::Fatal`]; cancellation is reported as
//! [`DownloadResult::Cancelled`], never as an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{classify_resolve_failure, FailureClass, FetchError, ResolveAttemptError};
use super::policy::MAX_FETCH_ATTEMPTS;
use crate::identity::ArtifactIdentity;
use crate::source::ArtifactSource;
use crate::store::PersistentStore;
use crate::stream::{copy_until_cancelled, ArtifactStream, EphemeralFile};

/// Per-call download preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContext {
    /// Download into a private ephemeral file instead of the store.
    pub direct_download: bool,

    /// Directory for direct-download files. Created if absent.
    pub direct_download_dir: PathBuf,
}

impl DownloadContext {
    /// Downloads placed in the persistent store.
    pub fn shared(direct_download_dir: PathBuf) -> Self {
        Self {
            direct_download: false,
            direct_download_dir,
        }
    }

    /// Downloads placed in private ephemeral files under `dir`.
    pub fn direct(dir: PathBuf) -> Self {
        Self {
            direct_download: true,
            direct_download_dir: dir,
        }
    }
}

/// Status of a [`DownloadResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Available,
    NotFound,
    Cancelled,
}

/// The result of resolving a package.
///
/// An available result owns its stream. Dropping the stream of a direct
/// download deletes its backing file.
#[derive(Debug)]
pub enum DownloadResult {
    /// The package bytes are readable from the stream.
    Available(ArtifactStream),

    /// The source confirmed the package does not exist.
    NotFound,

    /// The caller cancelled the request.
    Cancelled,
}

impl DownloadResult {
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Available(_) => DownloadStatus::Available,
            Self::NotFound => DownloadStatus::NotFound,
            Self::Cancelled => DownloadStatus::Cancelled,
        }
    }

    /// Description of where the bytes came from, if available.
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Available(stream) => Some(stream.source()),
            _ => None,
        }
    }

    /// Take the stream out of an available result.
    pub fn into_stream(self) -> Option<ArtifactStream> {
        match self {
            Self::Available(stream) => Some(stream),
            _ => None,
        }
    }
}

/// Per-identity async locks for store-bound downloads.
///
/// Entries are removed when the last holder or waiter releases them.
#[derive(Default)]
struct IdentityGates {
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl IdentityGates {
    /// Wait for the gate of `key`. Returns `None` if `cancel` fires first.
    async fn enter(&self, key: &str, cancel: &CancellationToken) -> Option<IdentityGate<'_>> {
        let gate = Arc::clone(self.gates.lock().entry(key.to_string()).or_default());

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = gate.lock_owned() => Some(guard),
        };

        match guard {
            Some(guard) => Some(IdentityGate {
                gates: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            None => {
                self.release(key);
                None
            }
        }
    }

    /// Drop the entry for `key` if nobody else holds or waits on it.
    fn release(&self, key: &str) {
        let mut gates = self.gates.lock();
        // The map holds one reference; any other belongs to a waiter.
        if gates.get(key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.gates.lock().len()
    }
}

struct IdentityGate<'a> {
    gates: &'a IdentityGates,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGate<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.gates.release(&self.key);
    }
}

/// Top-level orchestrator for fully identified package downloads.
pub struct DownloadResultResolver {
    source: Arc<dyn ArtifactSource>,
    store: Arc<dyn PersistentStore>,
    gates: IdentityGates,
}

impl DownloadResultResolver {
    /// Create a resolver downloading from `source` into `store`.
    pub fn new(source: Arc<dyn ArtifactSource>, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            source,
            store,
            gates: IdentityGates::default(),
        }
    }

    /// Resolve `identity` to a readable stream.
    ///
    /// A package already in the persistent store is returned without any
    /// network activity, regardless of `context`. Concurrent store-bound
    /// resolves of one identity in this process download it once.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Fatal`] for any failure outside the transient
    /// class, and for a transient failure on the final attempt.
    pub async fn resolve(
        &self,
        identity: &ArtifactIdentity,
        url: &str,
        context: &DownloadContext,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, FetchError> {
        if let Some(stream) = self.stored(identity).await {
            return Ok(DownloadResult::Available(stream));
        }

        let _gate = if context.direct_download {
            None
        } else {
            let Some(gate) = self.gates.enter(&package_key(identity), cancel).await else {
                debug!(package = %identity, url, "Download cancelled while waiting for another");
                return Ok(DownloadResult::Cancelled);
            };
            if let Some(stream) = self.stored(identity).await {
                return Ok(DownloadResult::Available(stream));
            }
            Some(gate)
        };

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            let err = match self.attempt(identity, url, context, cancel).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            match classify_resolve_failure(&err, cancel) {
                FailureClass::Cancelled => {
                    debug!(package = %identity, url, attempt, "Download cancelled");
                    return Ok(DownloadResult::Cancelled);
                }
                FailureClass::Retryable if attempt + 1 < MAX_FETCH_ATTEMPTS => {
                    info!(
                        package = %identity,
                        url,
                        attempt,
                        error = %err,
                        "Transient download failure; retrying"
                    );
                }
                FailureClass::Retryable | FailureClass::Terminal => {
                    error!(
                        package = %identity,
                        url,
                        attempts = attempt + 1,
                        error = %err,
                        "Download failed"
                    );
                    return Err(FetchError::Fatal {
                        identity: identity.clone(),
                        url: url.to_string(),
                        source: Box::new(err),
                    });
                }
            }
        }

        unreachable!("the final resolve attempt always returns")
    }

    async fn stored(&self, identity: &ArtifactIdentity) -> Option<ArtifactStream> {
        match self.store.try_get(identity).await {
            Ok(Some(stream)) => {
                debug!(package = %identity, "Package found in global store");
                Some(stream)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(package = %identity, error = %e, "Global store lookup failed, downloading");
                None
            }
        }
    }

    async fn attempt(
        &self,
        identity: &ArtifactIdentity,
        url: &str,
        context: &DownloadContext,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, ResolveAttemptError> {
        let Some(mut stream) = self.source.open_stream(url, cancel).await? else {
            return Ok(DownloadResult::NotFound);
        };
        let source = self.source.description();

        if !context.direct_download {
            let stored = self.store.put(identity, stream, source, cancel).await?;
            return Ok(DownloadResult::Available(stored));
        }

        let mut file = EphemeralFile::create_in(
            &context.direct_download_dir,
            &direct_download_prefix(identity),
        )
        .await?;
        match copy_until_cancelled(&mut stream, &mut file, cancel).await {
            Some(copied) => {
                let bytes = copied?;
                debug!(
                    package = %identity,
                    path = %file.path().display(),
                    bytes,
                    "Direct download complete"
                );
            }
            None => return Err(ResolveAttemptError::Cancelled),
        }
        file.rewind().await?;

        Ok(DownloadResult::Available(ArtifactStream::ephemeral(file, source)))
    }
}

/// File name prefix for direct downloads: `{lower id}.{lower version}.`
pub fn direct_download_prefix(identity: &ArtifactIdentity) -> String {
    format!("{}.", package_key(identity))
}

fn package_key(identity: &ArtifactIdentity) -> String {
    format!(
        "{}.{}",
        identity.name().to_lowercase(),
        identity.normalized_version().to_lowercase()
    )
}
