//! HTTP artifact source backed by a shared disk cache.
//!
//! Cache files live at `<cache root>/<first 16 hex chars of sha256(url)>/
//! <cache key>.dat`. A download is written to a `-new` temp file next to the
//! cache file, validated, and renamed over the cache file while holding the
//! cache file lock. Readers take the same lock, so nobody opens a cache file
//! that is being replaced.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ArtifactSource, BoxFuture, ByteStream, SourceError, SourceRequest, SourceResponse};
use crate::config::FetchConfig;
use crate::lock::FileLockManager;
use crate::stream::EphemeralFile;

/// Hex characters of the URL hash used for the cache bucket directory.
const URL_HASH_LEN: usize = 16;

/// Package archive source over HTTP with a local disk cache.
pub struct HttpCacheSource {
    client: Client,
    cache_root: PathBuf,
    locks: FileLockManager,
    description: String,
}

impl HttpCacheSource {
    /// Create a source from runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ClientBuild`] if the HTTP client cannot be
    /// created (e.g. TLS backend initialization failure).
    pub fn new(config: &FetchConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| SourceError::ClientBuild(e.to_string()))?;

        Ok(Self::with_client(
            client,
            config.http_cache_dir.clone(),
            config.lock_manager(),
        ))
    }

    /// Create a source with an existing client.
    pub fn with_client(client: Client, cache_root: PathBuf, locks: FileLockManager) -> Self {
        let description = format!("http (cache: {})", cache_root.display());
        Self {
            client,
            cache_root,
            locks,
            description,
        }
    }

    /// Root directory of the disk cache.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Path of the cache file for `url` under `cache_key`.
    pub fn cache_file_path(&self, url: &str, cache_key: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
        self.cache_root
            .join(&digest[..URL_HASH_LEN])
            .join(format!("{}.dat", cache_key))
    }

    async fn fetch(
        &self,
        request: SourceRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SourceResponse, SourceError> {
        if request.policy.direct_download {
            return self.download_direct(&request, cancel).await;
        }

        let cache_file = self.cache_file_path(request.url, request.cache_key);
        if self.serve_cached(&request, &cache_file, cancel).await? {
            return Ok(SourceResponse::CacheFile(cache_file));
        }
        self.download_to_cache(&request, &cache_file, cancel).await
    }

    /// True if a fresh, valid cache file can be served.
    async fn serve_cached(
        &self,
        request: &SourceRequest<'_>,
        cache_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, SourceError> {
        let max_age = request.policy.max_age;
        if max_age.is_zero() {
            return Ok(false);
        }
        match file_age(cache_file).await {
            Some(age) if age < max_age => {}
            _ => return Ok(false),
        }

        let _guard = self.locks.acquire(cache_file, cancel).await?;
        match request.validator.validate(request.url, cache_file) {
            Ok(()) => {
                debug!(url = request.url, path = %cache_file.display(), "Serving package from disk cache");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    path = %cache_file.display(),
                    error = %e,
                    "Cached package failed validation, deleting"
                );
                if let Err(e) = fs::remove_file(cache_file).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %cache_file.display(), error = %e, "Failed to delete cache file");
                    }
                }
                Ok(false)
            }
        }
    }

    async fn download_to_cache(
        &self,
        request: &SourceRequest<'_>,
        cache_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<SourceResponse, SourceError> {
        let url = request.url;
        let Some(response) = self.send(url, cancel).await? else {
            return Ok(SourceResponse::NotFound);
        };

        let dir = cache_file.parent().unwrap_or(self.cache_root.as_path());
        fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error(url, e))?;

        let file_name = cache_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (std_file, new_path) = tempfile::Builder::new()
            .prefix(&format!("{}-new", file_name))
            .tempfile_in(dir)
            .map_err(|e| io_error(url, e))?
            .into_parts();

        let mut file = File::from_std(std_file);
        let bytes = write_body(url, response, &mut file, cancel).await?;
        file.sync_all().await.map_err(|e| io_error(url, e))?;
        drop(file);

        request.validator.validate(url, &new_path)?;

        let _guard = self.locks.acquire(cache_file, cancel).await?;
        new_path
            .persist(cache_file)
            .map_err(|e| io_error(url, e.error))?;

        info!(url, bytes, path = %cache_file.display(), "Downloaded package to disk cache");
        Ok(SourceResponse::CacheFile(cache_file.to_path_buf()))
    }

    async fn download_direct(
        &self,
        request: &SourceRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SourceResponse, SourceError> {
        let url = request.url;
        let Some(response) = self.send(url, cancel).await? else {
            return Ok(SourceResponse::NotFound);
        };

        let prefix = format!("{}.", request.cache_key);
        let mut file = EphemeralFile::create_in(&request.policy.temp_root, &prefix)
            .await
            .map_err(|e| io_error(url, e))?;
        let bytes = write_body(url, response, &mut file, cancel).await?;
        file.rewind().await.map_err(|e| io_error(url, e))?;

        request.validator.validate(url, file.path())?;

        debug!(url, bytes, "Downloaded package directly");
        Ok(SourceResponse::Stream(Box::pin(file)))
    }

    /// Send a GET. `Ok(None)` means the server answered 404.
    async fn send(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Response>, SourceError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SourceError::Cancelled { url: url.to_string() });
            }
            response = self.client.get(url).send() => {
                response.map_err(|e| request_error(url, e))?
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url, "Package not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Some(response))
    }
}

impl ArtifactSource for HttpCacheSource {
    fn get<'a>(
        &'a self,
        request: SourceRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SourceResponse, SourceError>> {
        Box::pin(self.fetch(request, cancel))
    }

    fn open_stream<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, SourceError>> {
        Box::pin(async move {
            let Some(response) = self.send(url, cancel).await? else {
                return Ok(None);
            };
            let body = response.bytes_stream().map_err(body_error);
            let stream: ByteStream = Box::pin(StreamReader::new(body));
            Ok(Some(stream))
        })
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Stream a response body into `writer`, honouring cancellation.
async fn write_body<W>(
    url: &str,
    response: Response,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64, SourceError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut body = Box::pin(response.bytes_stream());
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SourceError::Cancelled { url: url.to_string() });
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| io_error(url, e))?;
                written += bytes.len() as u64;
            }
            Some(Err(e)) if e.is_timeout() => {
                return Err(SourceError::Timeout {
                    url: url.to_string(),
                })
            }
            Some(Err(e)) => return Err(io_error(url, body_error(e))),
            None => break,
        }
    }

    writer.flush().await.map_err(|e| io_error(url, e))?;
    Ok(written)
}

/// Age of a file from its modification time. `None` if it does not exist.
async fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or(Duration::ZERO))
}

fn io_error(url: &str, source: io::Error) -> SourceError {
    SourceError::Io {
        url: url.to_string(),
        source,
    }
}

/// Map a failed request to a source error.
///
/// Timeouts and connection failures are reported in the shapes the retry
/// classification treats as transient.
fn request_error(url: &str, err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_connect() {
        io_error(url, io::Error::new(io::ErrorKind::ConnectionRefused, err))
    } else {
        SourceError::Http {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Map a body read failure to an I/O error with a socket-like kind.
fn body_error(err: reqwest::Error) -> io::Error {
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else if err.is_connect() {
        io::ErrorKind::ConnectionRefused
    } else if err.is_body() || err.is_request() {
        io::ErrorKind::ConnectionAborted
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err)
}
