//! Configuration CLI commands.
//!
//! Provides `config path` and `config show` for locating the configuration
//! file and viewing the settings in effect.

use clap::Subcommand;
use pkgfetch::config::{config_file_path, ConfigFile, FetchConfig};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Show the settings in effect (file values over defaults)
    Show,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => run_path(),
        ConfigCommands::Show => run_show(),
    }
}

/// Show the configuration file path.
fn run_path() -> Result<(), CliError> {
    println!("{}", config_file_path()?.display());
    Ok(())
}

/// Show the effective configuration.
fn run_show() -> Result<(), CliError> {
    let file = ConfigFile::load()?;
    let config = FetchConfig::from_config_file(&file);

    println!("Configuration Settings");
    println!("======================");
    println!();
    println!("[cache]");
    println!("  http_cache = {}", config.http_cache_dir.display());
    println!("  global_packages = {}", config.global_packages_dir.display());
    println!("  temp = {}", config.temp_root.display());
    println!("  max_age_secs = {}", config.max_age.as_secs());
    println!();
    println!("[network]");
    println!("  timeout_secs = {}", config.http_timeout.as_secs());
    println!("  lock_timeout_secs = {}", config.lock_timeout.as_secs());

    Ok(())
}
