//! Sanity checks applied to downloaded archives before they are accepted.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::SourceError;

/// Zip local file header signature.
const ZIP_LOCAL_HEADER: [u8; 4] = *b"PK\x03\x04";

/// Zip end-of-central-directory signature (an empty archive).
const ZIP_EMPTY_ARCHIVE: [u8; 4] = *b"PK\x05\x06";

/// Validates a downloaded file before a source reports it as usable.
pub trait ArchiveValidator: Send + Sync {
    /// Check the file at `path`, downloaded from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidArchive`] when the contents are unusable.
    fn validate(&self, url: &str, path: &Path) -> Result<(), SourceError>;
}

/// Accepts files that start with a zip signature.
///
/// Package archives are zip files. This catches HTML error pages, truncated
/// bodies and proxy junk without parsing the archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct NupkgValidator;

impl ArchiveValidator for NupkgValidator {
    fn validate(&self, url: &str, path: &Path) -> Result<(), SourceError> {
        let invalid = |reason: String| SourceError::InvalidArchive {
            url: url.to_string(),
            reason,
        };
        let io_error = |source| SourceError::Io {
            url: url.to_string(),
            source,
        };

        let mut file = File::open(path).map_err(io_error)?;
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let read = file.read(&mut header[filled..]).map_err(io_error)?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled == 0 {
            return Err(invalid("response body is empty".to_string()));
        }
        if filled < header.len() || (header != ZIP_LOCAL_HEADER && header != ZIP_EMPTY_ARCHIVE)
        {
            return Err(invalid(format!(
                "missing zip signature (found {:02x?})",
                &header[..filled]
            )));
        }
        Ok(())
    }
}

/// Accepts every file. For sources whose payloads are not zip archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyArchive;

impl ArchiveValidator for AcceptAnyArchive {
    fn validate(&self, _url: &str, _path: &Path) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_accepts_zip_header() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.nupkg", b"PK\x03\x04rest-of-archive");
        assert!(NupkgValidator.validate("http://x/a.nupkg", &path).is_ok());
    }

    #[test]
    fn test_accepts_empty_zip() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.nupkg", b"PK\x05\x06\0\0\0\0");
        assert!(NupkgValidator.validate("http://x/a.nupkg", &path).is_ok());
    }

    #[test]
    fn test_rejects_html() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.nupkg", b"<html>error</html>");
        let err = NupkgValidator
            .validate("http://x/a.nupkg", &path)
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidArchive { .. }));
        assert!(err.to_string().contains("missing zip signature"));
    }

    #[test]
    fn test_rejects_empty_body() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.nupkg", b"");
        let err = NupkgValidator
            .validate("http://x/a.nupkg", &path)
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_rejects_short_body() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.nupkg", b"PK");
        assert!(NupkgValidator.validate("http://x/a.nupkg", &path).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = NupkgValidator
            .validate("http://x/a.nupkg", &dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_accept_any() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.txt", b"TestContent");
        assert!(AcceptAnyArchive.validate("http://x", &path).is_ok());
    }
}
