//! CLI error type.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use pkgfetch::config::ConfigError;
use pkgfetch::FetchError;

/// Errors surfaced to the user by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Loading or interpreting configuration failed.
    Config(String),

    /// The async runtime could not be started.
    Runtime(io::Error),

    /// The Ctrl-C handler could not be installed.
    Signal(String),

    /// Setting up the HTTP source failed.
    Source(String),

    /// The download failed.
    Fetch(FetchError),

    /// The package does not exist at the given URL.
    NotFound { package: String, url: String },

    /// The download was interrupted.
    Cancelled,

    /// Writing the output file failed.
    Output { path: PathBuf, source: io::Error },

    /// Clearing the HTTP cache failed.
    CacheClear(String),

    /// Reading HTTP cache statistics failed.
    CacheStats(String),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::NotFound { .. } => ExitCode::from(2),
            CliError::Cancelled => ExitCode::from(130),
            _ => ExitCode::FAILURE,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::Signal(msg) => write!(f, "Failed to install Ctrl-C handler: {}", msg),
            CliError::Source(msg) => write!(f, "Failed to create HTTP source: {}", msg),
            CliError::Fetch(e) => write!(f, "{}", e),
            CliError::NotFound { package, url } => {
                write!(f, "Package {} not found at {}", package, url)
            }
            CliError::Cancelled => write!(f, "Download cancelled"),
            CliError::Output { path, source } => {
                write!(f, "Failed to write {}: {}", path.display(), source)
            }
            CliError::CacheClear(msg) => write!(f, "Failed to clear cache: {}", msg),
            CliError::CacheStats(msg) => write!(f, "Failed to read cache statistics: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            CliError::Fetch(e) => Some(e),
            CliError::Output { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<FetchError> for CliError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Cancelled => CliError::Cancelled,
            e => CliError::Fetch(e),
        }
    }
}
