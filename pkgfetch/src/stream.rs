//! Owned artifact streams handed to callers.
//!
//! An [`ArtifactStream`] is a seekable reader over either a private
//! [`EphemeralFile`] or a file owned by the persistent store. Every caller gets
//! its own handle with its own position, even when two handles read the same
//! store file.
//!
//! Ephemeral files are deleted deterministically when their handle is
//! dropped; nothing relies on finalizers or process exit. Dropping is best
//! effort on platforms that refuse to delete open files: if a read is still
//! running on the blocking pool the handle outlives the delete. Callers that
//! need a guaranteed cleanup call `close`, which waits for the handle first.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Length of the random suffix appended to ephemeral file names.
pub const RANDOM_SUFFIX_LEN: usize = 8;

// =============================================================================
// Ephemeral File
// =============================================================================

/// A private temporary file deleted when the handle is dropped.
///
/// The file name is `{prefix}{random suffix}` so it stays readable in a
/// directory listing while remaining unique without any locking.
#[derive(Debug)]
pub struct EphemeralFile {
    // Field order matters: the handle closes before the path is removed.
    file: File,
    path: TempPath,
}

impl EphemeralFile {
    /// Create a new ephemeral file in `dir`, creating the directory if needed.
    pub async fn create_in(dir: &Path, prefix: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let named = tempfile::Builder::new()
            .prefix(prefix)
            .rand_bytes(RANDOM_SUFFIX_LEN)
            .tempfile_in(dir)?;
        let (file, path) = named.into_parts();

        Ok(Self {
            file: File::from_std(file),
            path,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush pending writes and seek back to the start for reading.
    pub async fn rewind(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    /// Close the handle, then delete the file.
    ///
    /// Unlike drop, this waits for any in-flight operation on the handle and
    /// reports a failed delete.
    pub async fn close(self) -> io::Result<()> {
        let Self { file, path } = self;
        drop(file.into_std().await);
        path.close()
    }
}

impl AsyncRead for EphemeralFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl AsyncWrite for EphemeralFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

impl AsyncSeek for EphemeralFile {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().file).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().file).poll_complete(cx)
    }
}

// =============================================================================
// Artifact Stream
// =============================================================================

#[derive(Debug)]
enum Backing {
    Ephemeral(EphemeralFile),
    Stored(File),
}

/// Seekable stream over a delivered artifact.
///
/// The caller owns the stream and releases it by dropping it. For ephemeral
/// streams that also deletes the backing file.
#[derive(Debug)]
pub struct ArtifactStream {
    backing: Backing,
    source: String,
}

impl ArtifactStream {
    /// Wrap a private ephemeral file.
    pub fn ephemeral(file: EphemeralFile, source: impl Into<String>) -> Self {
        Self {
            backing: Backing::Ephemeral(file),
            source: source.into(),
        }
    }

    /// Wrap a file owned by the persistent store.
    pub fn stored(file: File, source: impl Into<String>) -> Self {
        Self {
            backing: Backing::Stored(file),
            source: source.into(),
        }
    }

    /// Where the bytes came from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when dropping this stream deletes its backing file.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.backing, Backing::Ephemeral(_))
    }

    /// Path of the backing file for ephemeral streams.
    pub fn ephemeral_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Ephemeral(file) => Some(file.path()),
            Backing::Stored(_) => None,
        }
    }

    /// Release the stream, waiting for its handle to close.
    ///
    /// Ephemeral backing files are deleted once the handle is closed.
    pub async fn close(self) -> io::Result<()> {
        match self.backing {
            Backing::Ephemeral(file) => file.close().await,
            Backing::Stored(file) => {
                drop(file.into_std().await);
                Ok(())
            }
        }
    }
}

impl AsyncRead for ArtifactStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().backing {
            Backing::Ephemeral(file) => Pin::new(file).poll_read(cx, buf),
            Backing::Stored(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for ArtifactStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match &mut self.get_mut().backing {
            Backing::Ephemeral(file) => Pin::new(file).start_seek(position),
            Backing::Stored(file) => Pin::new(file).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match &mut self.get_mut().backing {
            Backing::Ephemeral(file) => Pin::new(file).poll_complete(cx),
            Backing::Stored(file) => Pin::new(file).poll_complete(cx),
        }
    }
}

/// Copy `reader` into `writer` and flush.
///
/// Returns `None` if `cancel` fires before the copy completes.
pub(crate) async fn copy_until_cancelled<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Option<io::Result<u64>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copy = async {
        let copied = tokio::io::copy(reader, writer).await?;
        writer.flush().await?;
        Ok::<_, io::Error>(copied)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = copy => Some(result),
    }
}
