//! Cache management CLI commands.

use clap::Subcommand;
use pkgfetch::cache::{clear_http_cache, format_size, http_cache_stats};
use pkgfetch::config::{ConfigFile, FetchConfig};

use crate::error::CliError;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Clear the HTTP disk cache, removing all cached archives and unused lock files
    Clear,
    /// Show HTTP disk cache statistics
    Stats,
}

/// Run a cache subcommand.
pub fn run(action: CacheAction) -> Result<(), CliError> {
    let file = ConfigFile::load()?;
    let config = FetchConfig::from_config_file(&file);
    let cache_dir = &config.http_cache_dir;

    match action {
        CacheAction::Clear => {
            println!("Clearing HTTP cache at: {}", cache_dir.display());

            let result =
                clear_http_cache(cache_dir).map_err(|e| CliError::CacheClear(e.to_string()))?;
            println!(
                "Deleted {} files, freed {}",
                result.files_deleted,
                format_size(result.bytes_freed)
            );

            let pruned = config
                .lock_manager()
                .prune_unused()
                .map_err(|e| CliError::CacheClear(e.to_string()))?;
            println!("Removed {} unused lock files", pruned);
            Ok(())
        }
        CacheAction::Stats => {
            println!("HTTP cache: {}", cache_dir.display());

            match http_cache_stats(cache_dir) {
                Ok((files, bytes)) => {
                    println!("  Files: {}", files);
                    println!("  Size:  {}", format_size(bytes));
                    Ok(())
                }
                Err(e) => Err(CliError::CacheStats(e.to_string())),
            }
        }
    }
}
