//! Result of a single logical fetch.

use std::path::{Path, PathBuf};

/// Tagged result of one fetch through the retry layer.
///
/// Outcomes are cheap to clone so that every caller coalesced onto the same
/// in-flight fetch observes the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The source confirmed the artifact does not exist.
    NotFound,

    /// Every attempt failed. Nothing is known about the artifact, so a later
    /// caller may try again.
    Exhausted,

    /// The caller's cancellation token fired.
    Cancelled,

    /// The bytes live in a shared cache file that must be read under its file lock.
    CacheFile {
        /// Path of the finalized cache file.
        path: PathBuf,
    },

    /// The network bytes were handled during the fetch; no file remains.
    StreamConsumed {
        /// Whether the bytes were copied to the caller's destination.
        bytes_copied: bool,
    },
}

impl FetchOutcome {
    /// Returns the cache file path for [`FetchOutcome::CacheFile`].
    pub fn cache_file(&self) -> Option<&Path> {
        match self {
            Self::CacheFile { path } => Some(path),
            _ => None,
        }
    }

    /// True when a later caller could reuse this outcome without a network request.
    pub fn is_memoizable(&self) -> bool {
        matches!(self, Self::CacheFile { .. })
    }

    /// True when the outcome says nothing lasting about the URL and a later
    /// shared caller should fetch again rather than reuse it.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Exhausted | Self::StreamConsumed { bytes_copied: false }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_file_accessor() {
        let outcome = FetchOutcome::CacheFile {
            path: PathBuf::from("/cache/a.dat"),
        };
        assert_eq!(outcome.cache_file(), Some(Path::new("/cache/a.dat")));
        assert!(outcome.is_memoizable());
    }

    #[test]
    fn test_non_file_outcomes_not_memoizable() {
        for outcome in [
            FetchOutcome::NotFound,
            FetchOutcome::Exhausted,
            FetchOutcome::Cancelled,
            FetchOutcome::StreamConsumed { bytes_copied: true },
        ] {
            assert!(outcome.cache_file().is_none());
            assert!(!outcome.is_memoizable());
        }
    }

    #[test]
    fn test_only_transient_outcomes_are_retriable() {
        assert!(FetchOutcome::Exhausted.is_retriable());
        assert!(FetchOutcome::Cancelled.is_retriable());
        assert!(FetchOutcome::StreamConsumed { bytes_copied: false }.is_retriable());
        assert!(!FetchOutcome::NotFound.is_retriable());
        assert!(!FetchOutcome::StreamConsumed { bytes_copied: true }.is_retriable());
        assert!(!FetchOutcome::CacheFile {
            path: PathBuf::from("/cache/a.dat")
        }
        .is_retriable());
    }
}
