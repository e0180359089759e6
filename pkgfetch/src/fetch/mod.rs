//! Package archive acquisition.
//!
//! This module turns a (package identity, URL) pair into bytes at a
//! destination, deduplicating concurrent requests within the process and
//! sharing a disk cache safely across processes.
//!
//! # Architecture
//!
//! ```text
//! by id (enumerate versions)               by identity (exact package)
//! ──────────────────────────               ───────────────────────────
//! NupkgDownloader                          DownloadResultResolver
//!   │                                        │
//!   ├─► RequestCoalescer                     ├─► PersistentStore.try_get
//!   │     │  (InFlightRegistry)              │
//!   │     └─► RetryingFetcher                └─► ArtifactSource.open_stream
//!   │           └─► ArtifactSource.get             ├─► EphemeralFile (direct)
//!   │                                              └─► PersistentStore.put
//!   └─► ArtifactCopier (cache file lock)
//! ```
//!
//! # Failure handling
//!
//! Both retry loops make at most [`MAX_FETCH_ATTEMPTS`] attempts and consult
//! an explicit classification function (see [`FailureClass`]). The by-id path
//! never fails: exhausted attempts settle as [`FetchOutcome::Exhausted`]. The
//! by-identity path reports non-transient failures once as
//! [`FetchError::Fatal`]. Cancellation is always an outcome, not an error.

mod coalescer;
mod copier;
mod downloader;
mod error;
mod outcome;
mod policy;
mod resolver;
mod retry;

pub use coalescer::{InFlightRegistry, RequestCoalescer, SharedFetch};
pub use copier::ArtifactCopier;
pub use downloader::NupkgDownloader;
pub use error::{
    classify_fetch_failure, classify_resolve_failure, is_transient_io, FailureClass, FetchError,
    FetchResult, ResolveAttemptError,
};
pub use outcome::FetchOutcome;
pub use policy::{cache_key, CachePolicy, FetchMode, MAX_FETCH_ATTEMPTS, NUPKG_CACHE_KEY_PREFIX};
pub use resolver::{
    direct_download_prefix, DownloadContext, DownloadResult, DownloadResultResolver,
    DownloadStatus,
};
pub use retry::{FetchRequest, RetryingFetcher};
