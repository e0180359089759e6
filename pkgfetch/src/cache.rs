//! Maintenance operations on the HTTP disk cache directory.

use std::fs;
use std::io;
use std::path::Path;

/// Summary of a cache clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearResult {
    pub files_deleted: u64,
    pub bytes_freed: u64,
}

/// Delete every file in the HTTP cache directory.
///
/// The directory itself is kept. A missing directory is an empty cache.
/// Files that disappear while clearing are skipped; they were removed by
/// another process.
pub fn clear_http_cache(dir: &Path) -> io::Result<ClearResult> {
    let mut result = ClearResult::default();
    if !dir.exists() {
        return Ok(result);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let (files, bytes) = http_cache_stats(&path)?;
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    result.files_deleted += files;
                    result.bytes_freed += bytes;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        } else {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    result.files_deleted += 1;
                    result.bytes_freed += len;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }

    Ok(result)
}

/// Count files and total bytes under the HTTP cache directory.
pub fn http_cache_stats(dir: &Path) -> io::Result<(u64, u64)> {
    if !dir.exists() {
        return Ok((0, 0));
    }

    let mut files = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        if metadata.is_dir() {
            let (sub_files, sub_bytes) = http_cache_stats(&entry.path())?;
            files += sub_files;
            bytes += sub_bytes;
        } else {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

/// Format a byte count for display, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
