//! pkgfetch - Package archive acquisition with a shared disk cache
//!
//! This library downloads package archives (`.nupkg` files) over HTTP and
//! delivers them to callers. Concurrent requests for the same URL within a
//! process are coalesced into a single download, the on-disk HTTP cache is
//! shared safely between processes through file locks, and transient network
//! failures are retried a bounded number of times.
//!
//! Two entry points cover the two ways packages are requested:
//!
//! - [`NupkgDownloader::copy_nupkg_to`] copies the archive behind a URL into a
//!   caller-supplied writer (used when enumerating versions of a package id).
//! - [`DownloadResultResolver::resolve`] returns a seekable stream for an exact
//!   package identity, consulting the persistent package store first.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pkgfetch::config::FetchConfig;
//! use pkgfetch::source::HttpCacheSource;
//! use pkgfetch::store::GlobalPackageStore;
//! use pkgfetch::{ArtifactIdentity, DownloadResultResolver};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FetchConfig::default();
//! let source = Arc::new(HttpCacheSource::new(&config)?);
//! let store = Arc::new(GlobalPackageStore::new(
//!     config.global_packages_dir.clone(),
//!     config.lock_manager(),
//! ));
//!
//! let resolver = DownloadResultResolver::new(source, store);
//! let identity = ArtifactIdentity::new("PackageA", "1.0.0");
//! let result = resolver
//!     .resolve(
//!         &identity,
//!         "https://example.org/packagea.1.0.0.nupkg",
//!         &config.download_context(false),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{:?}", result.status());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod source;
pub mod store;
pub mod stream;

pub use fetch::{
    CachePolicy, DownloadContext, DownloadResult, DownloadResultResolver, FetchError,
    FetchOutcome, NupkgDownloader,
};
pub use identity::ArtifactIdentity;
pub use stream::ArtifactStream;
