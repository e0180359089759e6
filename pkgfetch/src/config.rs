//! Runtime configuration and the on-disk INI configuration file.
//!
//! [`FetchConfig`] carries every directory and timeout the fetch layers need.
//! It starts from platform defaults and can be overridden from a
//! [`ConfigFile`] stored at `<config dir>/pkgfetch/config.ini`:
//!
//! ```ini
//! [cache]
//! http_cache = /var/cache/pkgfetch/http
//! global_packages = /home/me/.pkgfetch/packages
//! temp = /tmp/pkgfetch
//! max_age_secs = 1800
//!
//! [network]
//! timeout_secs = 100
//! lock_timeout_secs = 120
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::fetch::{CachePolicy, DownloadContext};
use crate::lock::{FileLockManager, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Application directory name under the platform config and cache roots.
pub const APP_DIR_NAME: &str = "pkgfetch";

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Default HTTP request timeout (100 seconds).
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(100);

/// Default maximum age of a disk cache entry (30 minutes).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 60);

const SECTION_CACHE: &str = "cache";
const SECTION_NETWORK: &str = "network";

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform has no configuration directory.
    #[error("could not determine the configuration directory")]
    NoConfigDir,

    /// Reading or writing the file failed.
    #[error("failed to access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid INI.
    #[error("failed to parse config file: {0}")]
    Parse(String),

    /// A key has a value that cannot be used.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

// =============================================================================
// Runtime configuration
// =============================================================================

/// Directories and timeouts used by the fetch layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Directory of the shared HTTP disk cache.
    pub http_cache_dir: PathBuf,

    /// Root for temporary files created while fetching.
    pub temp_root: PathBuf,

    /// Root of the persistent global package store.
    pub global_packages_dir: PathBuf,

    /// Directory for private direct-download files.
    pub direct_download_dir: PathBuf,

    /// Directory holding cross-process lock files.
    pub lock_dir: PathBuf,

    /// Maximum time to wait for a cache file lock.
    pub lock_timeout: Duration,

    /// Delay between lock acquisition attempts.
    pub lock_poll_interval: Duration,

    /// HTTP request timeout.
    pub http_timeout: Duration,

    /// Maximum age of a disk cache entry served without a request.
    pub max_age: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME);
        let temp_root = std::env::temp_dir().join(APP_DIR_NAME);
        let global_packages_dir = dirs::home_dir()
            .map(|home| home.join(".pkgfetch").join("packages"))
            .unwrap_or_else(|| cache_root.join("packages"));

        Self {
            http_cache_dir: cache_root.join("http-cache"),
            direct_download_dir: temp_root.join("direct"),
            lock_dir: temp_root.join("locks"),
            temp_root,
            global_packages_dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_POLL_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl FetchConfig {
    /// Apply the values set in `file` on top of the defaults.
    pub fn from_config_file(file: &ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(dir) = &file.http_cache {
            config.http_cache_dir = dir.clone();
        }
        if let Some(dir) = &file.global_packages {
            config.global_packages_dir = dir.clone();
        }
        if let Some(dir) = &file.temp {
            config = config.with_temp_root(dir.clone());
        }
        if let Some(secs) = file.max_age_secs {
            config.max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = file.timeout_secs {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.lock_timeout_secs {
            config.lock_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Set the HTTP cache directory.
    pub fn with_http_cache_dir(mut self, dir: PathBuf) -> Self {
        self.http_cache_dir = dir;
        self
    }

    /// Set the temp root. Direct-download and lock directories move with it.
    pub fn with_temp_root(mut self, dir: PathBuf) -> Self {
        self.direct_download_dir = dir.join("direct");
        self.lock_dir = dir.join("locks");
        self.temp_root = dir;
        self
    }

    /// Set the global package store directory.
    pub fn with_global_packages_dir(mut self, dir: PathBuf) -> Self {
        self.global_packages_dir = dir;
        self
    }

    /// Set the direct-download directory.
    pub fn with_direct_download_dir(mut self, dir: PathBuf) -> Self {
        self.direct_download_dir = dir;
        self
    }

    /// Set the lock file directory.
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = dir;
        self
    }

    /// Set the lock wait timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the HTTP timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the default cache max-age.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Cache policy for a first attempt with the configured max-age.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::new(self.max_age, self.temp_root.clone())
    }

    /// Lock manager for the configured lock directory.
    pub fn lock_manager(&self) -> FileLockManager {
        FileLockManager::new(self.lock_dir.clone())
            .with_timeout(self.lock_timeout)
            .with_poll_interval(self.lock_poll_interval)
    }

    /// Download context for the resolver.
    pub fn download_context(&self, direct_download: bool) -> DownloadContext {
        DownloadContext {
            direct_download,
            direct_download_dir: self.direct_download_dir.clone(),
        }
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Values read from `config.ini`. Unset keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub http_cache: Option<PathBuf>,
    pub global_packages: Option<PathBuf>,
    pub temp: Option<PathBuf>,
    pub max_age_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub lock_timeout_secs: Option<u64>,
}

/// Path of the configuration file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

impl ConfigFile {
    /// Load the configuration file from its default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path()?)
    }

    /// Load the configuration file at `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Parse configuration from INI text. Unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let get = |section: &str, key: &str| {
            ini.section(Some(section))
                .and_then(|props| props.get(key))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let path = |section: &str, key: &str| get(section, key).map(PathBuf::from);
        let secs = |section: &str, key: &str| -> Result<Option<u64>, ConfigError> {
            get(section, key)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                        key: format!("{}.{}", section, key),
                        value: value.to_string(),
                    })
                })
                .transpose()
        };

        Ok(Self {
            http_cache: path(SECTION_CACHE, "http_cache"),
            global_packages: path(SECTION_CACHE, "global_packages"),
            temp: path(SECTION_CACHE, "temp"),
            max_age_secs: secs(SECTION_CACHE, "max_age_secs")?,
            timeout_secs: secs(SECTION_NETWORK, "timeout_secs")?,
            lock_timeout_secs: secs(SECTION_NETWORK, "lock_timeout_secs")?,
        })
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        self.to_ini().write_to_file(path).map_err(io_err)
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();

        let paths = [
            ("http_cache", &self.http_cache),
            ("global_packages", &self.global_packages),
            ("temp", &self.temp),
        ];
        for (key, value) in paths {
            if let Some(value) = value {
                ini.with_section(Some(SECTION_CACHE))
                    .set(key, value.display().to_string());
            }
        }
        if let Some(secs) = self.max_age_secs {
            ini.with_section(Some(SECTION_CACHE))
                .set("max_age_secs", secs.to_string());
        }

        let numbers = [
            ("timeout_secs", self.timeout_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
        ];
        for (key, value) in numbers {
            if let Some(value) = value {
                ini.with_section(Some(SECTION_NETWORK))
                    .set(key, value.to_string());
            }
        }
        ini
    }
}
