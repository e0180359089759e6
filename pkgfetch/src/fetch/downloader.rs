//! Package archive download by id and version.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use super::coalescer::RequestCoalescer;
use super::copier::ArtifactCopier;
use super::error::FetchError;
use super::outcome::FetchOutcome;
use super::policy::{CachePolicy, FetchMode};
use super::retry::{FetchRequest, RetryingFetcher};
use crate::identity::ArtifactIdentity;
use crate::lock::FileLockManager;
use crate::source::ArtifactSource;

/// Copies package archives to caller destinations through the coalescer.
///
/// Direct-download policies run in [`FetchMode::Private`]: the destination is
/// handed to the fetch so raw network bytes go straight into it. Everything
/// else is coalesced and copied from the shared cache file afterwards.
pub struct NupkgDownloader {
    coalescer: RequestCoalescer,
    copier: ArtifactCopier,
}

impl NupkgDownloader {
    /// Create a downloader over `source`, locking cache files with `locks`.
    pub fn new(source: Arc<dyn ArtifactSource>, locks: FileLockManager) -> Self {
        let fetcher = Arc::new(RetryingFetcher::new(source));
        Self::from_parts(RequestCoalescer::new(fetcher), ArtifactCopier::new(locks))
    }

    /// Assemble a downloader from an existing coalescer and copier.
    pub fn from_parts(coalescer: RequestCoalescer, copier: ArtifactCopier) -> Self {
        Self { coalescer, copier }
    }

    /// The coalescer used for fetches.
    pub fn coalescer(&self) -> &RequestCoalescer {
        &self.coalescer
    }

    /// Copy the archive for `identity` from `url` into `destination`.
    ///
    /// Returns `Ok(false)` when the package was not found or every attempt
    /// failed.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if `cancel` fires
    /// - [`FetchError::Lock`] or [`FetchError::CopyFailed`] if the cache file
    ///   could not be delivered
    pub async fn copy_nupkg_to(
        &self,
        identity: &ArtifactIdentity,
        url: &str,
        policy: &CachePolicy,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<bool, FetchError> {
        let request = FetchRequest::new(url, identity.clone(), policy.clone());
        let mode = policy.mode();

        let sink: Option<&mut (dyn AsyncWrite + Send + Unpin)> = match mode {
            FetchMode::Private => Some(&mut *destination),
            FetchMode::Shared => None,
        };
        let outcome = self.coalescer.acquire(&request, mode, sink, cancel).await;

        if outcome == FetchOutcome::Cancelled {
            return Err(FetchError::Cancelled);
        }
        self.copier.deliver(&outcome, destination, cancel).await
    }
}
