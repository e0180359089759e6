//! Error types and failure classification for the fetch layers.
//!
//! Retry loops never inspect error shapes directly. Each caught failure is
//! passed once to a classification function that returns a
//! [`FailureClass`]; the loop acts on the tag alone.
//!
//! | Path                      | Retryable                              | Terminal        | Cancelled             |
//! |---------------------------|----------------------------------------|-----------------|-----------------------|
//! | by-URL (coalesced) fetch  | every failure                          | never           | caller token fired    |
//! | download resolver         | socket-backed I/O, timeouts            | everything else | any cancellation      |

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::identity::ArtifactIdentity;
use crate::lock::LockError;
use crate::source::SourceError;
use crate::store::StoreError;

/// Result type for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors surfaced to callers of the fetch layers.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A download failed in a way that will not be retried.
    ///
    /// Carries the identity and URL for context plus the original cause.
    #[error("failed to download {identity} from {url}: {source}")]
    Fatal {
        identity: ArtifactIdentity,
        url: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Copying a cache file to the destination failed.
    #[error("failed to copy {} to destination: {source}", path.display())]
    CopyFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The cache file lock could not be taken.
    #[error(transparent)]
    Lock(LockError),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<LockError> for FetchError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled { .. } => Self::Cancelled,
            other => Self::Lock(other),
        }
    }
}

/// A failed attempt inside the download resolver.
#[derive(Debug, Error)]
pub enum ResolveAttemptError {
    /// The source failed to produce a stream.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The persistent store failed to place the package.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Copying into a private download file failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The caller's cancellation token fired mid-copy.
    #[error("download cancelled")]
    Cancelled,
}

// =============================================================================
// Classification
// =============================================================================

/// How a retry loop should treat a caught failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Try again if attempts remain.
    Retryable,

    /// Stop immediately and report the failure.
    Terminal,

    /// Stop immediately and report cancellation, not failure.
    Cancelled,
}

/// Classify a failure on the by-URL (coalesced) fetch path.
///
/// Only the caller's own cancellation stops the loop; cancellations raised
/// by the operation itself and every other error are retried.
pub fn classify_fetch_failure(_err: &SourceError, cancel: &CancellationToken) -> FailureClass {
    if cancel.is_cancelled() {
        FailureClass::Cancelled
    } else {
        FailureClass::Retryable
    }
}

/// Classify a failure on the download resolver path.
///
/// Only socket-backed I/O failures and timeouts are retried. Anything else
/// points at a non-transient condition (bad response, disk full) and is
/// terminal.
pub fn classify_resolve_failure(
    err: &ResolveAttemptError,
    cancel: &CancellationToken,
) -> FailureClass {
    if cancel.is_cancelled() {
        return FailureClass::Cancelled;
    }

    match err {
        ResolveAttemptError::Cancelled => FailureClass::Cancelled,
        ResolveAttemptError::Source(source) => match source {
            SourceError::Cancelled { .. } | SourceError::Lock(LockError::Cancelled { .. }) => {
                FailureClass::Cancelled
            }
            SourceError::Timeout { .. } => FailureClass::Retryable,
            SourceError::Io { source, .. } if is_transient_io(source) => FailureClass::Retryable,
            _ => FailureClass::Terminal,
        },
        ResolveAttemptError::Store(store) => match store {
            StoreError::Cancelled | StoreError::Lock(LockError::Cancelled { .. }) => {
                FailureClass::Cancelled
            }
            StoreError::Read { source } if is_transient_io(source) => FailureClass::Retryable,
            _ => FailureClass::Terminal,
        },
        ResolveAttemptError::Io(source) if is_transient_io(source) => FailureClass::Retryable,
        ResolveAttemptError::Io(_) => FailureClass::Terminal,
    }
}

/// True for I/O errors caused by a socket failure or a timeout.
pub fn is_transient_io(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | AddrNotAvailable
            | TimedOut
    ) || err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<io::Error>())
        .is_some_and(is_transient_io)
}
