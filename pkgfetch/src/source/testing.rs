//! Scripted [`ArtifactSource`] for unit tests.
//!
//! Each call to `get` or `open_stream` pops the next [`MockStep`] from the
//! script, falling back to a fixed step once the script is exhausted. Calls
//! and the policies they carried are recorded for assertions.

use std::collections::VecDeque;
use std::io::{self, Cursor};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::{
    ArtifactSource, BoxFuture, ByteStream, SourceError, SourceRequest, SourceResponse,
};
use crate::fetch::CachePolicy;

/// A scripted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    Timeout,
    Socket,
    Cancelled,
    Status,
    DiskFull,
}

impl MockFailure {
    fn into_error(self, url: &str) -> SourceError {
        let url = url.to_string();
        match self {
            Self::Timeout => SourceError::Timeout { url },
            Self::Socket => SourceError::Io {
                url,
                source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"),
            },
            Self::Cancelled => SourceError::Cancelled { url },
            Self::Status => SourceError::Status { url, status: 500 },
            Self::DiskFull => SourceError::Io {
                url,
                source: io::Error::new(io::ErrorKind::Other, "no space left on device"),
            },
        }
    }
}

/// One scripted response.
#[derive(Debug, Clone)]
pub(crate) enum MockStep {
    CacheFile(PathBuf),
    Stream(Vec<u8>),
    /// A stream that yields these bytes, then fails with a connection reset.
    Truncated(Vec<u8>),
    NotFound,
    Fail(MockFailure),
    /// Wait until the caller cancels.
    Hang,
}

pub(crate) struct MockSource {
    get_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    policies: Mutex<Vec<CachePolicy>>,
    script: Mutex<VecDeque<MockStep>>,
    fallback: MockStep,
    delay: Option<Duration>,
}

impl MockSource {
    /// A source that answers every call with `step`.
    pub(crate) fn always(step: MockStep) -> Self {
        Self::scripted(Vec::new(), step)
    }

    /// A source that plays `script` in order, then answers with `fallback`.
    pub(crate) fn scripted(script: Vec<MockStep>, fallback: MockStep) -> Self {
        Self {
            get_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            policies: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
        }
    }

    /// Sleep before answering each call.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn policies(&self) -> Vec<CachePolicy> {
        self.policies.lock().clone()
    }

    fn next_step(&self) -> MockStep {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn pause(&self, cancel: &CancellationToken) {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn bytes(content: Vec<u8>) -> ByteStream {
    Box::pin(Cursor::new(content))
}

fn truncated(content: Vec<u8>) -> ByteStream {
    Box::pin(Cursor::new(content).chain(ResetReader))
}

/// Reader whose every read fails with a connection reset.
struct ResetReader;

impl AsyncRead for ResetReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset mid-body",
        )))
    }
}

impl ArtifactSource for MockSource {
    fn get<'a>(
        &'a self,
        request: SourceRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<SourceResponse, SourceError>> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.policies.lock().push(request.policy.clone());
            let step = self.next_step();
            self.pause(cancel).await;

            match step {
                MockStep::CacheFile(path) => Ok(SourceResponse::CacheFile(path)),
                MockStep::Stream(content) => Ok(SourceResponse::Stream(bytes(content))),
                MockStep::Truncated(content) => Ok(SourceResponse::Stream(truncated(content))),
                MockStep::NotFound => Ok(SourceResponse::NotFound),
                MockStep::Fail(failure) => Err(failure.into_error(request.url)),
                MockStep::Hang => {
                    cancel.cancelled().await;
                    Err(SourceError::Cancelled {
                        url: request.url.to_string(),
                    })
                }
            }
        })
    }

    fn open_stream<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Option<ByteStream>, SourceError>> {
        Box::pin(async move {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next_step();
            self.pause(cancel).await;

            match step {
                MockStep::Stream(content) => Ok(Some(bytes(content))),
                MockStep::Truncated(content) => Ok(Some(truncated(content))),
                MockStep::NotFound => Ok(None),
                MockStep::CacheFile(path) => {
                    let content = tokio::fs::read(&path).await.map_err(|e| SourceError::Io {
                        url: url.to_string(),
                        source: e,
                    })?;
                    Ok(Some(bytes(content)))
                }
                MockStep::Fail(failure) => Err(failure.into_error(url)),
                MockStep::Hang => {
                    cancel.cancelled().await;
                    Err(SourceError::Cancelled {
                        url: url.to_string(),
                    })
                }
            }
        })
    }

    fn description(&self) -> &str {
        "mock"
    }
}
