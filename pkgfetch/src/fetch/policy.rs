//! Cache policy and fetch mode types.
//!
//! A [`CachePolicy`] tells the [`ArtifactSource`](crate::source::ArtifactSource)
//! how old a disk cache entry may be before it is considered stale, and where
//! temporary files go. The policy tightens on retries: attempt 0 uses the
//! caller's policy verbatim, every later attempt forces `max_age` to zero so a
//! poisoned or half-written cache entry cannot fail the same way twice.

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::ArtifactIdentity;

// =============================================================================
// Constants
// =============================================================================

/// Number of attempts made for a single logical fetch (indices 0, 1, 2).
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Prefix of every package archive cache key.
pub const NUPKG_CACHE_KEY_PREFIX: &str = "nupkg_";

// =============================================================================
// Cache Policy
// =============================================================================

/// Per-request disk cache policy.
///
/// `max_age` is a [`Duration`], so it can never be negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Maximum age of a cache entry that may be served without a network request.
    pub max_age: Duration,

    /// Root directory for temporary files created while fetching.
    pub temp_root: PathBuf,

    /// Bypass the shared disk cache and stream bytes to the caller directly.
    pub direct_download: bool,
}

impl CachePolicy {
    /// Create a policy that serves cache entries younger than `max_age`.
    pub fn new(max_age: Duration, temp_root: PathBuf) -> Self {
        Self {
            max_age,
            temp_root,
            direct_download: false,
        }
    }

    /// Create a policy that always treats existing cache entries as stale.
    pub fn no_cache(temp_root: PathBuf) -> Self {
        Self::new(Duration::ZERO, temp_root)
    }

    /// Enable or disable direct download.
    pub fn with_direct_download(mut self, direct: bool) -> Self {
        self.direct_download = direct;
        self
    }

    /// Derive the policy for a given attempt index.
    ///
    /// Attempt 0 returns the policy unchanged; every retry forces
    /// `max_age = 0` and keeps `temp_root` and `direct_download`.
    pub fn for_attempt(&self, attempt: u32) -> CachePolicy {
        if attempt == 0 {
            self.clone()
        } else {
            CachePolicy {
                max_age: Duration::ZERO,
                ..self.clone()
            }
        }
    }

    /// The fetch mode implied by this policy.
    pub fn mode(&self) -> FetchMode {
        FetchMode::from_direct_download(self.direct_download)
    }
}

// =============================================================================
// Fetch Mode
// =============================================================================

/// Whether a request may share work with other callers in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Coalesce with concurrent requests for the same URL and memoize the
    /// resulting cache file.
    Shared,

    /// Always run an independent fetch. Accepts duplicate network cost in
    /// exchange for isolation.
    Private,
}

impl FetchMode {
    /// Private for direct downloads, shared otherwise.
    pub fn from_direct_download(direct: bool) -> Self {
        if direct {
            Self::Private
        } else {
            Self::Shared
        }
    }
}

/// Build the disk cache key for a package archive.
///
/// The format is `nupkg_{name}.{normalized version}`. Case is preserved as
/// provided; callers lower-case upstream when they need case-insensitive keys.
pub fn cache_key(identity: &ArtifactIdentity) -> String {
    format!(
        "{}{}.{}",
        NUPKG_CACHE_KEY_PREFIX,
        identity.name(),
        identity.normalized_version()
    )
}
