//! Fetch command - download one package archive to a file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use pkgfetch::config::{ConfigFile, FetchConfig};
use pkgfetch::source::HttpCacheSource;
use pkgfetch::store::GlobalPackageStore;
use pkgfetch::{ArtifactIdentity, DownloadResult, DownloadResultResolver, NupkgDownloader};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CliError;

/// Arguments for the fetch command.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Package id
    pub id: String,

    /// Package version
    pub version: String,

    /// URL of the package archive
    pub url: String,

    /// Download into a private temp file instead of a shared cache
    #[arg(long)]
    pub direct: bool,

    /// Copy through the shared HTTP cache instead of the global package store
    #[arg(long)]
    pub http_cache: bool,

    /// Maximum age in seconds of a usable HTTP cache entry
    #[arg(long, value_name = "SECS", requires = "http_cache")]
    pub max_age: Option<u64>,

    /// Output file (default: <id>.<version>.nupkg in the current directory)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Run the fetch command.
pub async fn run(args: FetchArgs, cancel: &CancellationToken) -> Result<(), CliError> {
    let file = ConfigFile::load()?;
    let mut config = FetchConfig::from_config_file(&file);
    if let Some(secs) = args.max_age {
        config = config.with_max_age(Duration::from_secs(secs));
    }

    let identity = ArtifactIdentity::new(args.id.as_str(), args.version.as_str());
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(default_output_name(&identity)));
    debug!(package = %identity, url = %args.url, output = %output.display(), "Fetching package");

    let source =
        Arc::new(HttpCacheSource::new(&config).map_err(|e| CliError::Source(e.to_string()))?);

    let bytes = if args.http_cache {
        fetch_via_http_cache(&config, source, &identity, &args, &output, cancel).await?
    } else {
        fetch_via_store(&config, source, &identity, &args, &output, cancel).await?
    };

    println!(
        "Saved {} to {} ({})",
        identity,
        output.display(),
        pkgfetch::cache::format_size(bytes)
    );
    Ok(())
}

/// Resolve through the global package store.
async fn fetch_via_store(
    config: &FetchConfig,
    source: Arc<HttpCacheSource>,
    identity: &ArtifactIdentity,
    args: &FetchArgs,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<u64, CliError> {
    let store = Arc::new(GlobalPackageStore::new(
        config.global_packages_dir.clone(),
        config.lock_manager(),
    ));
    let resolver = DownloadResultResolver::new(source, store);

    let result = resolver
        .resolve(
            identity,
            &args.url,
            &config.download_context(args.direct),
            cancel,
        )
        .await?;

    let mut stream = match result {
        DownloadResult::Available(stream) => stream,
        DownloadResult::NotFound => return Err(not_found(identity, &args.url)),
        DownloadResult::Cancelled => return Err(CliError::Cancelled),
    };
    println!("Source: {}", stream.source());

    let output_err = |source| CliError::Output {
        path: output.to_path_buf(),
        source,
    };
    let mut file = File::create(output).await.map_err(output_err)?;
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CliError::Cancelled),
        copied = tokio::io::copy(&mut stream, &mut file) => copied.map_err(output_err)?,
    };
    file.flush().await.map_err(output_err)?;

    if let Err(e) = stream.close().await {
        warn!(error = %e, "Failed to release downloaded package stream");
    }
    Ok(bytes)
}

/// Copy through the shared HTTP cache with request coalescing.
async fn fetch_via_http_cache(
    config: &FetchConfig,
    source: Arc<HttpCacheSource>,
    identity: &ArtifactIdentity,
    args: &FetchArgs,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<u64, CliError> {
    let downloader = NupkgDownloader::new(source, config.lock_manager());
    let policy = config.cache_policy().with_direct_download(args.direct);

    let output_err = |source| CliError::Output {
        path: output.to_path_buf(),
        source,
    };
    let mut file = File::create(output).await.map_err(output_err)?;
    let delivered = downloader
        .copy_nupkg_to(identity, &args.url, &policy, &mut file, cancel)
        .await?;
    file.flush().await.map_err(output_err)?;

    if !delivered {
        drop(file);
        // Best effort: an empty output file is worse than none
        let _ = tokio::fs::remove_file(output).await;
        return Err(not_found(identity, &args.url));
    }

    let metadata = tokio::fs::metadata(output).await.map_err(output_err)?;
    Ok(metadata.len())
}

fn not_found(identity: &ArtifactIdentity, url: &str) -> CliError {
    CliError::NotFound {
        package: identity.to_string(),
        url: url.to_string(),
    }
}

/// Default output file name: `{lower id}.{lower normalized version}.nupkg`.
pub fn default_output_name(identity: &ArtifactIdentity) -> String {
    format!(
        "{}.{}.nupkg",
        identity.name().to_lowercase(),
        identity.normalized_version().to_lowercase()
    )
}
