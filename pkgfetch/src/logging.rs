//! Logging setup for binaries embedding the library.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`], a stderr
//! layer and an optional non-blocking file layer. `RUST_LOG` overrides the
//! configured level when set.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Crates whose events pass the default filter.
const LOG_TARGETS: [&str; 2] = ["pkgfetch", "pkgfetch_cli"];

/// Errors that can occur while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for this crate's targets when `RUST_LOG` is unset.
    pub level: Level,

    /// Explicit filter directives. Takes precedence over `RUST_LOG`.
    pub filter: Option<String>,

    /// Also write logs to this file.
    pub log_file: Option<PathBuf>,

    /// Use ANSI colors on stderr.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            filter: None,
            log_file: None,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Set the default level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also write logs to `path`.
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Keeps the file writer alive. Hold it until the process exits.
#[must_use = "dropping the guard stops the log file writer"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Default filter directives for `level`.
pub fn default_filter(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let env_filter = match &config.filter {
        Some(filter) => EnvFilter::try_new(filter).map_err(|e| LoggingError::InvalidFilter {
            filter: filter.clone(),
            reason: e.to_string(),
        })?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level))),
    };

    let timer = OffsetTime::local_rfc_3339()
        .unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .with_timer(timer.clone());

    let (file_layer, file_guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            fs::create_dir_all(&dir).map_err(|e| LoggingError::CreateDir {
                path: dir.clone(),
                source: e,
            })?;

            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "pkgfetch.log".into());
            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_timer(timer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}
