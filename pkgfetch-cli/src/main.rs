//! pkgfetch CLI - Command-line interface
//!
//! Downloads package archives through the pkgfetch library and manages its
//! on-disk HTTP cache.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pkgfetch::logging::{init_logging, LoggingConfig};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use commands::fetch::FetchArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "pkgfetch", version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a package archive
    Fetch(FetchArgs),

    /// Manage the HTTP disk cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let mut logging = LoggingConfig::default().with_level(level);
    if let Some(path) = cli.log_file.clone() {
        logging = logging.with_log_file(path);
    }
    let _guard = match init_logging(logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Fetch(args) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            ctrlc::set_handler(move || {
                eprintln!("\nInterrupted, cancelling download...");
                on_interrupt.cancel();
            })
            .map_err(|e| CliError::Signal(e.to_string()))?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(CliError::Runtime)?;
            runtime.block_on(commands::fetch::run(args, &cancel))
        }
        Commands::Cache { action } => commands::cache::run(action),
        Commands::Config { command } => commands::config::run(command),
    }
}
