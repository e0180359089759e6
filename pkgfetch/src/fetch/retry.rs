//! Bounded retry loop around a single logical fetch.
//!
//! [`RetryingFetcher`] makes at most [`MAX_FETCH_ATTEMPTS`] calls to its
//! [`ArtifactSource`]. Every retry runs with `max_age = 0` so a bad cache
//! entry cannot fail the same way twice. Failures are classified with
//! [`classify_fetch_failure`]; when all attempts fail the fetch settles as
//! [`FetchOutcome::Exhausted`] rather than an error, letting callers treat it
//! as an empty result without mistaking it for a confirmed 404.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::{classify_fetch_failure, FailureClass};
use super::outcome::FetchOutcome;
use super::policy::{cache_key, CachePolicy, MAX_FETCH_ATTEMPTS};
use crate::identity::ArtifactIdentity;
use crate::source::{
    ArchiveValidator, ArtifactSource, NupkgValidator, SourceError, SourceRequest, SourceResponse,
};
use crate::stream::{copy_until_cancelled, EphemeralFile};

/// A request for one package archive by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// URL of the package archive.
    pub url: String,

    /// Identity of the package, used for the cache key and diagnostics.
    pub identity: ArtifactIdentity,

    /// Caller's cache policy for the first attempt.
    pub policy: CachePolicy,
}

impl FetchRequest {
    /// Create a new fetch request.
    pub fn new(url: impl Into<String>, identity: ArtifactIdentity, policy: CachePolicy) -> Self {
        Self {
            url: url.into(),
            identity,
            policy,
        }
    }

    /// Disk cache key for this request.
    pub fn cache_key(&self) -> String {
        cache_key(&self.identity)
    }
}

/// Runs a fetch with up to three attempts and a tightening cache policy.
pub struct RetryingFetcher {
    source: Arc<dyn ArtifactSource>,
    validator: Arc<dyn ArchiveValidator>,
}

impl RetryingFetcher {
    /// Create a fetcher that validates archives with [`NupkgValidator`].
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self::with_validator(source, Arc::new(NupkgValidator))
    }

    /// Create a fetcher with a custom archive validator.
    pub fn with_validator(
        source: Arc<dyn ArtifactSource>,
        validator: Arc<dyn ArchiveValidator>,
    ) -> Self {
        Self { source, validator }
    }

    /// The underlying source.
    pub fn source(&self) -> &Arc<dyn ArtifactSource> {
        &self.source
    }

    /// Fetch `request`, retrying transient failures.
    ///
    /// If the source answers with a raw network stream and `sink` is set, the
    /// body is staged in an ephemeral file under the attempt's temp root and
    /// copied into `sink` only once it is complete, so a failed attempt never
    /// leaves partial bytes in the destination. The outcome is then
    /// `StreamConsumed { bytes_copied: true }`. Without a sink the stream is
    /// dropped and the outcome is `StreamConsumed { bytes_copied: false }`.
    ///
    /// Returns [`FetchOutcome::Cancelled`] only when `cancel` fires. Every
    /// other failure is retried and, once attempts run out, reported as
    /// [`FetchOutcome::Exhausted`].
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        mut sink: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let cache_key = request.cache_key();

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            let policy = request.policy.for_attempt(attempt);
            let source_request = SourceRequest {
                url: &request.url,
                cache_key: &cache_key,
                policy: &policy,
                validator: self.validator.as_ref(),
            };

            let result = match self.source.get(source_request, cancel).await {
                Ok(response) => {
                    accept_response(
                        &request.url,
                        &cache_key,
                        &policy,
                        response,
                        sink.is_some(),
                        cancel,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(Accepted::Outcome(outcome)) => {
                    debug!(url = %request.url, attempt, outcome = ?outcome, "Fetch completed");
                    return outcome;
                }
                Ok(Accepted::Staged(staged)) => {
                    return deliver_staged(request, staged, sink.as_deref_mut(), cancel).await;
                }
                Err(e) => e,
            };

            match classify_fetch_failure(&err, cancel) {
                FailureClass::Cancelled => {
                    debug!(url = %request.url, attempt, "Fetch cancelled by caller");
                    return FetchOutcome::Cancelled;
                }
                FailureClass::Retryable if attempt + 1 < MAX_FETCH_ATTEMPTS => {
                    if err.is_cancellation() {
                        info!(
                            url = %request.url,
                            attempt,
                            "Fetch was cancelled, it may have been served elsewhere; retrying"
                        );
                    } else {
                        info!(url = %request.url, attempt, error = %err, "Fetch failed; retrying");
                    }
                }
                FailureClass::Retryable | FailureClass::Terminal => {
                    error!(
                        url = %request.url,
                        package = %request.identity,
                        attempts = attempt + 1,
                        error = %err,
                        "Fetch failed"
                    );
                    break;
                }
            }
        }

        FetchOutcome::Exhausted
    }
}

/// What one attempt produced.
enum Accepted {
    Outcome(FetchOutcome),
    /// A complete network body waiting to be copied to the caller.
    Staged(EphemeralFile),
}

/// Turn a source response into an outcome, staging raw streams the caller
/// wants to keep.
async fn accept_response(
    url: &str,
    cache_key: &str,
    policy: &CachePolicy,
    response: SourceResponse,
    wants_bytes: bool,
    cancel: &CancellationToken,
) -> Result<Accepted, SourceError> {
    match response {
        SourceResponse::NotFound => Ok(Accepted::Outcome(FetchOutcome::NotFound)),
        SourceResponse::CacheFile(path) => Ok(Accepted::Outcome(FetchOutcome::CacheFile { path })),
        SourceResponse::Stream(mut stream) => {
            if !wants_bytes {
                return Ok(Accepted::Outcome(FetchOutcome::StreamConsumed {
                    bytes_copied: false,
                }));
            }

            let mut staged = EphemeralFile::create_in(&policy.temp_root, &format!("{cache_key}."))
                .await
                .map_err(|e| SourceError::Io {
                    url: url.to_string(),
                    source: e,
                })?;
            copy_stream(url, &mut stream, &mut staged, cancel).await?;
            Ok(Accepted::Staged(staged))
        }
    }
}

/// Copy a fully staged body into the caller's sink.
///
/// Not retried: once bytes reach the sink another attempt would append to them.
async fn deliver_staged<W>(
    request: &FetchRequest,
    mut staged: EphemeralFile,
    sink: Option<&mut W>,
    cancel: &CancellationToken,
) -> FetchOutcome
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let Some(sink) = sink else {
        return FetchOutcome::StreamConsumed {
            bytes_copied: false,
        };
    };

    let result = match staged.rewind().await {
        Ok(()) => copy_until_cancelled(&mut staged, sink, cancel).await,
        Err(e) => Some(Err(e)),
    };

    if let Err(e) = staged.close().await {
        debug!(url = %request.url, error = %e, "Failed to remove staged download");
    }

    match result {
        Some(Ok(copied)) => {
            debug!(url = %request.url, bytes = copied, "Fetched stream copied to destination");
            FetchOutcome::StreamConsumed { bytes_copied: true }
        }
        Some(Err(e)) => {
            error!(
                url = %request.url,
                package = %request.identity,
                error = %e,
                "Failed to write fetched package to destination"
            );
            FetchOutcome::StreamConsumed {
                bytes_copied: false,
            }
        }
        None => FetchOutcome::Cancelled,
    }
}

async fn copy_stream<R, W>(
    url: &str,
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64, SourceError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    match copy_until_cancelled(reader, writer, cancel).await {
        Some(Ok(copied)) => Ok(copied),
        Some(Err(e)) => Err(SourceError::Io {
            url: url.to_string(),
            source: e,
        }),
        None => Err(SourceError::Cancelled {
            url: url.to_string(),
        }),
    }
}
