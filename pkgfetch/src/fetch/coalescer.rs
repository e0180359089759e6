//! In-process request coalescing for package archive fetches.
//!
//! Shared-mode requests for the same URL are merged into one
//! [`RetryingFetcher`] run. The first caller publishes the computation in the
//! [`InFlightRegistry`] before awaiting it, so callers arriving mid-fetch wait
//! on the same result instead of starting new work.
//!
//! ```text
//! caller A ──┐
//! caller B ──┼──► registry[url] ──► Shared<fetch> ──► ArtifactSource
//! caller C ──┘       (one entry)        (one run)
//! ```
//!
//! Private-mode requests bypass the registry. When one of them produces a
//! cache file anyway, the result is recorded so a later shared caller can
//! skip the network.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::outcome::FetchOutcome;
use super::policy::FetchMode;
use super::retry::{FetchRequest, RetryingFetcher};

/// A fetch computation that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct InFlightEntry {
    fetch: SharedFetch,
    /// Token the computation runs under.
    origin: CancellationToken,
}

impl InFlightEntry {
    /// Cancelled or exhausted computations are not answers for later callers.
    fn is_stale(&self) -> bool {
        match self.fetch.peek() {
            Some(outcome) => outcome.is_retriable(),
            None => self.origin.is_cancelled(),
        }
    }
}

/// URL → shared fetch computation, guarded by one mutex.
///
/// The mutex is held only for lookup and insert, never across an await.
/// Settled answers (a cache file or a confirmed 404) stay for the lifetime of
/// the registry. A computation that was cancelled or ran out of attempts is
/// replaced by the next shared caller.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<String, InFlightEntry>>,
}

impl InFlightRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live computation for `url`, or publish the one built by
    /// `start`.
    ///
    /// The boolean is true when `start` ran and its computation was inserted.
    pub fn get_or_insert_with<F>(
        &self,
        url: &str,
        origin: &CancellationToken,
        start: F,
    ) -> (SharedFetch, bool)
    where
        F: FnOnce() -> SharedFetch,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(url) {
            if !entry.is_stale() {
                return (entry.fetch.clone(), false);
            }
        }

        let fetch = start();
        entries.insert(
            url.to_string(),
            InFlightEntry {
                fetch: fetch.clone(),
                origin: origin.clone(),
            },
        );
        (fetch, true)
    }

    /// Record an already-settled outcome if no entry exists for `url`.
    ///
    /// Returns true if the outcome was inserted.
    pub fn insert_if_absent(&self, url: &str, outcome: FetchOutcome) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(url).is_some_and(|entry| !entry.is_stale()) {
            return false;
        }
        entries.insert(
            url.to_string(),
            InFlightEntry {
                fetch: future::ready(outcome).boxed().shared(),
                origin: CancellationToken::new(),
            },
        );
        true
    }

    /// Number of URLs with an entry.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no URL has an entry.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// True if `url` has an entry, settled or not.
    pub fn contains(&self, url: &str) -> bool {
        self.entries.lock().contains_key(url)
    }

    /// The outcome for `url` if its computation has settled.
    pub fn settled_outcome(&self, url: &str) -> Option<FetchOutcome> {
        self.entries
            .lock()
            .get(url)
            .and_then(|entry| entry.fetch.peek().cloned())
    }
}

/// Ensures at most one in-flight shared fetch per URL.
pub struct RequestCoalescer {
    fetcher: Arc<RetryingFetcher>,
    registry: Arc<InFlightRegistry>,
}

impl RequestCoalescer {
    /// Create a coalescer with its own empty registry.
    pub fn new(fetcher: Arc<RetryingFetcher>) -> Self {
        Self::with_registry(fetcher, Arc::new(InFlightRegistry::new()))
    }

    /// Create a coalescer over an existing registry.
    pub fn with_registry(fetcher: Arc<RetryingFetcher>, registry: Arc<InFlightRegistry>) -> Self {
        Self { fetcher, registry }
    }

    /// The registry of in-flight and memoized fetches.
    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// Acquire the outcome for `request`.
    ///
    /// In [`FetchMode::Shared`] the caller joins an existing computation for
    /// the URL or starts one; `sink` is not used because shared fetches never
    /// hand raw streams to a single caller. Cancelling `cancel` ends this
    /// caller's wait with [`FetchOutcome::Cancelled`]. The computation itself
    /// runs under the token of the caller that started it.
    ///
    /// In [`FetchMode::Private`] the fetch always runs, with `sink` receiving
    /// any raw network stream.
    pub async fn acquire(
        &self,
        request: &FetchRequest,
        mode: FetchMode,
        sink: Option<&mut (dyn AsyncWrite + Send + Unpin)>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        match mode {
            FetchMode::Private => {
                let outcome = self.fetcher.fetch(request, sink, cancel).await;
                if outcome.is_memoizable()
                    && self.registry.insert_if_absent(&request.url, outcome.clone())
                {
                    debug!(url = %request.url, "Recorded private fetch result for shared callers");
                }
                outcome
            }
            FetchMode::Shared => {
                let (fetch, started) =
                    self.registry
                        .get_or_insert_with(&request.url, cancel, || self.start(request, cancel));
                if !started {
                    debug!(url = %request.url, "Request coalesced - waiting for in-flight fetch");
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => FetchOutcome::Cancelled,
                    outcome = fetch => outcome,
                }
            }
        }
    }

    fn start(&self, request: &FetchRequest, cancel: &CancellationToken) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let request = request.clone();
        let token = cancel.clone();

        async move { fetcher.fetch(&request, None, &token).await }
            .boxed()
            .shared()
    }
}
