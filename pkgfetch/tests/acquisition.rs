//! Integration tests for package acquisition.
//!
//! These tests drive the public API end to end with an in-memory source and
//! the real on-disk store, lock manager and copier:
//! - Direct downloads into private ephemeral files
//! - Shared downloads through the global package store
//! - Request coalescing and private-mode isolation
//! - Retry bounds and cache policy escalation
//! - Cache file lock correctness between a writer and concurrent readers
//!
//! Run with: `cargo test --test acquisition`

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use pkgfetch::fetch::{
    ArtifactCopier, CachePolicy, DownloadContext, DownloadResult, DownloadResultResolver,
    DownloadStatus, FetchOutcome, NupkgDownloader, MAX_FETCH_ATTEMPTS,
};
use pkgfetch::lock::FileLockManager;
use pkgfetch::source::{
    ArtifactSource, BoxFuture, ByteStream, SourceError, SourceRequest, SourceResponse,
};
use pkgfetch::store::GlobalPackageStore;
use pkgfetch::ArtifactIdentity;

const CONTENT: &[u8] = b"TestContent";
const URL: &str = "http://fake/content.nupkg";

// ============================================================================
// Test Source
// ============================================================================

/// In-memory source that counts calls and fails a configurable number of
/// times before succeeding.
struct CountingSource {
    cache_dir: PathBuf,
    content: Vec<u8>,
    failures_before_success: usize,
    delay: Duration,
    get_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    max_ages: Mutex<Vec<Duration>>,
}

impl CountingSource {
    fn new(cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            content: CONTENT.to_vec(),
            failures_before_success: 0,
            delay: Duration::ZERO,
            get_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            max_ages: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn socket_error(url: &str) -> SourceError {
        SourceError::Io {
            url: url.to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
        }
    }
}

impl ArtifactSource for CountingSource {
    fn get<'a>(
        &'a self,
        request: SourceRequest<'a>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SourceResponse, SourceError>> {
        Box::pin(async move {
            let call = self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.max_ages.lock().push(request.policy.max_age);
            tokio::time::sleep(self.delay).await;

            if call < self.failures_before_success {
                return Err(Self::socket_error(request.url));
            }
            if request.policy.direct_download {
                let stream: ByteStream = Box::pin(Cursor::new(self.content.clone()));
                return Ok(SourceResponse::Stream(stream));
            }

            let path = self.cache_dir.join(format!("{}.dat", request.cache_key));
            std::fs::create_dir_all(&self.cache_dir).map_err(|e| SourceError::Io {
                url: request.url.to_string(),
                source: e,
            })?;
            std::fs::write(&path, &self.content).map_err(|e| SourceError::Io {
                url: request.url.to_string(),
                source: e,
            })?;
            Ok(SourceResponse::CacheFile(path))
        })
    }

    fn open_stream<'a>(
        &'a self,
        url: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, SourceError>> {
        Box::pin(async move {
            let call = self.stream_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures_before_success {
                return Err(Self::socket_error(url));
            }
            let stream: ByteStream = Box::pin(Cursor::new(self.content.clone()));
            Ok(Some(stream))
        })
    }

    fn description(&self) -> &str {
        "http://fake"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn identity() -> ArtifactIdentity {
    ArtifactIdentity::new("PackageA", "1.0.0-Beta")
}

fn locks(dir: &TempDir) -> FileLockManager {
    FileLockManager::new(dir.path().join("locks")).with_poll_interval(Duration::from_millis(5))
}

fn resolver(dir: &TempDir, source: Arc<CountingSource>) -> DownloadResultResolver {
    let store = GlobalPackageStore::new(dir.path().join("packages"), locks(dir));
    DownloadResultResolver::new(source, Arc::new(store))
}

fn entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(read) => read
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn read_available(result: DownloadResult) -> Vec<u8> {
    let mut stream = result.into_stream().expect("result should be available");
    let mut content = Vec::new();
    stream.read_to_end(&mut content).await.unwrap();
    content
}

// ============================================================================
// Download Resolver
// ============================================================================

/// Two concurrent direct downloads each land in their own private file named
/// after the package, are readable through the returned streams, and leave
/// nothing behind once the streams are dropped.
#[tokio::test]
async fn test_direct_downloads_use_ephemeral_files() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")));
    let resolver = resolver(&dir, source.clone());
    let direct_dir = dir.path().join("direct");
    let context = DownloadContext::direct(direct_dir.clone());
    let cancel = CancellationToken::new();
    let identity = identity();

    let (first, second) = tokio::join!(
        resolver.resolve(&identity, URL, &context, &cancel),
        resolver.resolve(&identity, URL, &context, &cancel),
    );
    let mut streams = Vec::new();
    for result in [first.unwrap(), second.unwrap()] {
        assert_eq!(result.status(), DownloadStatus::Available);
        assert_eq!(result.source(), Some("http://fake"));
        streams.push(result.into_stream().unwrap());
    }

    let mut names = Vec::new();
    for stream in &streams {
        assert!(stream.is_ephemeral());
        let name = stream
            .ephemeral_path()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with("packagea.1.0.0-beta."), "unexpected name {name}");
        names.push(name);
    }
    assert_ne!(names[0], names[1]);
    assert_eq!(entries(&direct_dir).len(), 2);

    for stream in &mut streams {
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, CONTENT);
    }
    assert_eq!(source.stream_calls(), 2);

    drop(streams);
    assert!(entries(&direct_dir).is_empty());
    assert!(entries(&dir.path().join("packages")).is_empty());
}

/// A shared download is placed in the store; the next resolve is served from
/// the store without touching the source.
#[tokio::test]
async fn test_store_hit_skips_network() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")));
    let resolver = resolver(&dir, source.clone());
    let context = DownloadContext::shared(dir.path().join("direct"));
    let cancel = CancellationToken::new();

    let first = resolver.resolve(&identity(), URL, &context, &cancel).await.unwrap();
    assert_eq!(read_available(first).await, CONTENT);
    assert_eq!(source.stream_calls(), 1);

    // Even a direct-download request is answered by the store
    let direct = DownloadContext::direct(dir.path().join("direct"));
    let second = resolver.resolve(&identity(), URL, &direct, &cancel).await.unwrap();
    assert_eq!(read_available(second).await, CONTENT);
    assert_eq!(source.stream_calls(), 1);
    assert!(entries(&dir.path().join("direct")).is_empty());
}

/// Two concurrent shared resolves of one package download it once and leave
/// exactly the archive and its marker in the store.
#[tokio::test]
async fn test_concurrent_shared_resolves_download_once() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(
        CountingSource::new(&dir.path().join("http")).with_delay(Duration::from_millis(50)),
    );
    let resolver = resolver(&dir, source.clone());
    let context = DownloadContext::shared(dir.path().join("direct"));
    let cancel = CancellationToken::new();
    let identity = identity();

    let (first, second) = tokio::join!(
        resolver.resolve(&identity, URL, &context, &cancel),
        resolver.resolve(&identity, URL, &context, &cancel),
    );

    assert_eq!(read_available(first.unwrap()).await, CONTENT);
    assert_eq!(read_available(second.unwrap()).await, CONTENT);
    assert_eq!(source.stream_calls(), 1);

    let mut stored = entries(&dir.path().join("packages/packagea/1.0.0-beta"));
    stored.sort();
    assert_eq!(
        stored,
        vec![
            "packagea.1.0.0-beta.nupkg".to_string(),
            "packagea.1.0.0-beta.nupkg.sha256".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_resolver_retries_socket_failures() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")).failing(2));
    let resolver = resolver(&dir, source.clone());

    let result = resolver
        .resolve(
            &identity(),
            URL,
            &DownloadContext::shared(dir.path().join("direct")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(read_available(result).await, CONTENT);
    assert_eq!(source.stream_calls(), 3);
}

#[tokio::test]
async fn test_resolver_gives_up_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")).failing(usize::MAX));
    let resolver = resolver(&dir, source.clone());

    let err = resolver
        .resolve(
            &identity(),
            URL,
            &DownloadContext::shared(dir.path().join("direct")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains(URL));
    assert_eq!(source.stream_calls(), MAX_FETCH_ATTEMPTS as usize);
}

// ============================================================================
// Downloader (coalesced path)
// ============================================================================

/// Concurrent shared requests for one URL produce exactly one fetch, and every
/// caller receives the full content.
#[tokio::test]
async fn test_concurrent_downloads_are_coalesced() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(
        CountingSource::new(&dir.path().join("http")).with_delay(Duration::from_millis(50)),
    );
    let downloader = Arc::new(NupkgDownloader::new(source.clone(), locks(&dir)));
    let policy = CachePolicy::new(Duration::from_secs(1800), dir.path().join("tmp"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let downloader = downloader.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let mut destination = Vec::new();
            let copied = downloader
                .copy_nupkg_to(
                    &identity(),
                    URL,
                    &policy,
                    &mut destination,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            (copied, destination)
        }));
    }

    for handle in handles {
        let (copied, destination) = handle.await.unwrap();
        assert!(copied);
        assert_eq!(destination, CONTENT);
    }
    assert_eq!(source.get_calls(), 1);
    assert_eq!(
        downloader.coalescer().registry().settled_outcome(URL),
        Some(FetchOutcome::CacheFile {
            path: dir.path().join("http").join("nupkg_PackageA.1.0.0-Beta.dat"),
        })
    );
}

/// Direct-download requests never share a fetch with anyone.
#[tokio::test]
async fn test_direct_downloads_are_isolated() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")));
    let downloader = NupkgDownloader::new(source.clone(), locks(&dir));
    let policy = CachePolicy::new(Duration::from_secs(1800), dir.path().join("tmp"))
        .with_direct_download(true);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let mut destination = Vec::new();
        let copied = downloader
            .copy_nupkg_to(&identity(), URL, &policy, &mut destination, &cancel)
            .await
            .unwrap();
        assert!(copied);
        assert_eq!(destination, CONTENT);
    }

    assert_eq!(source.get_calls(), 2);
    assert!(downloader.coalescer().registry().is_empty());
}

/// Retries bypass the cache: the first attempt carries the caller's max-age,
/// later attempts carry zero.
#[tokio::test]
async fn test_retries_escalate_cache_policy() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")).failing(2));
    let downloader = NupkgDownloader::new(source.clone(), locks(&dir));
    let policy = CachePolicy::new(Duration::from_secs(1800), dir.path().join("tmp"));

    let mut destination = Vec::new();
    let copied = downloader
        .copy_nupkg_to(
            &identity(),
            URL,
            &policy,
            &mut destination,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(copied);
    assert_eq!(destination, CONTENT);
    assert_eq!(
        *source.max_ages.lock(),
        vec![Duration::from_secs(1800), Duration::ZERO, Duration::ZERO]
    );
}

/// Exhausted attempts are reported as "not delivered", not as an error.
#[tokio::test]
async fn test_exhausted_download_reports_false() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(CountingSource::new(&dir.path().join("http")).failing(usize::MAX));
    let downloader = NupkgDownloader::new(source.clone(), locks(&dir));
    let policy = CachePolicy::new(Duration::from_secs(1800), dir.path().join("tmp"));

    let mut destination = Vec::new();
    let copied = downloader
        .copy_nupkg_to(
            &identity(),
            URL,
            &policy,
            &mut destination,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!copied);
    assert!(destination.is_empty());
    assert_eq!(source.get_calls(), MAX_FETCH_ATTEMPTS as usize);
}

// ============================================================================
// Cache File Locking
// ============================================================================

/// A writer replaces a cache file in two steps while holding its lock.
/// Readers going through the copier must only ever observe complete versions.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_partial_replacement() {
    let dir = TempDir::new().unwrap();
    let locks = locks(&dir);
    let cache_file = dir.path().join("nupkg_packagea.1.0.0.dat");
    let versions: [Vec<u8>; 2] = [vec![b'a'; 4096], vec![b'b'; 4096]];
    std::fs::write(&cache_file, &versions[0]).unwrap();

    let writer = {
        let locks = locks.clone();
        let cache_file = cache_file.clone();
        let versions = versions.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for round in 0..20 {
                let content = &versions[round % 2];
                let _guard = locks.acquire(&cache_file, &cancel).await.unwrap();
                std::fs::write(&cache_file, &content[..content.len() / 2]).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                std::fs::write(&cache_file, content).unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let copier = ArtifactCopier::new(locks.clone());
        let outcome = FetchOutcome::CacheFile {
            path: cache_file.clone(),
        };
        let versions = versions.clone();
        readers.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..20 {
                let mut destination = Vec::new();
                assert!(copier
                    .deliver(&outcome, &mut destination, &cancel)
                    .await
                    .unwrap());
                assert!(
                    destination == versions[0] || destination == versions[1],
                    "observed a partial file of {} bytes",
                    destination.len()
                );
                tokio::task::yield_now().await;
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

/// Cancelling while waiting on a held lock reports cancellation promptly.
#[tokio::test]
async fn test_copy_cancelled_while_lock_held() {
    let dir = TempDir::new().unwrap();
    let locks = locks(&dir);
    let cache_file = dir.path().join("held.dat");
    std::fs::write(&cache_file, CONTENT).unwrap();

    let _held = locks
        .acquire(&cache_file, &CancellationToken::new())
        .await
        .unwrap();

    let copier = ArtifactCopier::new(locks.clone());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let mut destination = Vec::new();
    let result = copier
        .deliver(
            &FetchOutcome::CacheFile { path: cache_file },
            &mut destination,
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(pkgfetch::FetchError::Cancelled)));
    assert!(destination.is_empty());
}
