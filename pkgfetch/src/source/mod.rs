//! Artifact sources: where package bytes come from.
//!
//! An [`ArtifactSource`] performs an HTTP GET that may be answered from a
//! local disk cache. It reports unambiguously whether the bytes are backed by
//! a named, lockable cache file or by a raw network stream, and it must run
//! the request's [`ArchiveValidator`] before reporting success.
//!
//! ```text
//! ArtifactSource (trait)
//!         │
//!         ├── get()          ──► CacheFile(path) | Stream(bytes) | NotFound
//!         │                      (package archive fetch with disk cache)
//!         │
//!         └── open_stream()  ──► Some(bytes) | None
//!                                (plain streaming GET)
//! ```
//!
//! [`HttpCacheSource`] is the production implementation.

mod http;
mod validate;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::fetch::CachePolicy;
use crate::lock::LockError;

pub use http::HttpCacheSource;
pub use validate::{AcceptAnyArchive, ArchiveValidator, NupkgValidator};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Owned, readable byte stream handed between layers.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors reported by an [`ArtifactSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// The request exceeded the transport timeout.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The operation was cancelled by the transport or the caller.
    #[error("request to {url} was cancelled")]
    Cancelled { url: String },

    /// I/O failure while talking to the network or the disk cache.
    #[error("I/O error while fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },

    /// The server answered with a non-success status other than 404.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// The HTTP client failed for a reason other than timeout or connect.
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// The downloaded bytes failed validation.
    #[error("invalid package archive from {url}: {reason}")]
    InvalidArchive { url: String, reason: String },

    /// The cache file lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl SourceError {
    /// True for cancellations raised by the operation itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Lock(LockError::Cancelled { .. })
        )
    }
}

/// A cached package archive request.
pub struct SourceRequest<'a> {
    /// URL of the package archive.
    pub url: &'a str,

    /// Disk cache key (see [`cache_key`](crate::fetch::cache_key)).
    pub cache_key: &'a str,

    /// Cache policy for this attempt.
    pub policy: &'a CachePolicy,

    /// Validator that must accept the bytes before success is reported.
    pub validator: &'a dyn ArchiveValidator,
}

/// What a cached request produced.
pub enum SourceResponse {
    /// The server confirmed the artifact does not exist.
    NotFound,

    /// The bytes are in a shared cache file, protected by its file lock.
    CacheFile(PathBuf),

    /// The bytes are only available as a stream and must be consumed now.
    Stream(ByteStream),
}

impl fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NotFound"),
            Self::CacheFile(path) => f.debug_tuple("CacheFile").field(path).finish(),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// A source of package archive bytes.
///
/// Implementations must be `Send + Sync` so one source can serve every
/// concurrent request in the process.
pub trait ArtifactSource: Send + Sync {
    /// Fetch a package archive, consulting and populating the disk cache
    /// according to `request.policy`.
    ///
    /// Cancellation of `cancel` must surface as [`SourceError::Cancelled`].
    fn get<'a>(
        &'a self,
        request: SourceRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SourceResponse, SourceError>>;

    /// Open a plain streaming GET for `url`. `Ok(None)` means not found.
    fn open_stream<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, SourceError>>;

    /// Human-readable description of the source, e.g. its base URL.
    fn description(&self) -> &str;
}
