use anyhow::Result;
use clap::Parser;
use qrank::pipeline::{compute_qrank, BuildConfig};
use qrank::storage::StorageConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Builds the QRank ranking from Wikimedia dumps.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to Wikimedia dumps
    #[arg(long, default_value = "/public/dumps/public")]
    dumps: PathBuf,

    /// Process only a small fraction of the data; used for testing
    #[arg(long)]
    test_run: bool,

    /// Path to a JSON key with storage access credentials
    #[arg(long)]
    storage_key: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // https://wikitech.wikimedia.org/wiki/Help:Toolforge/Build_Service#Using_NFS_shared_storage
    if let Ok(tool_dir) = std::env::var("TOOL_DATA_DIR") {
        std::env::set_current_dir(&tool_dir)?;
    }

    let args = Args::parse();
    info!("qrank-builder starting up");

    if let Some(keypath) = &args.storage_key {
        // Fail fast on a bad key file; the deployment's storage client picks
        // up the artifacts once the build lands them in the cache directory.
        let storage = StorageConfig::load(Some(keypath))?;
        info!(endpoint = %storage.endpoint, "storage credentials loaded");
    }

    let config = BuildConfig {
        dumps: args.dumps,
        test_run: args.test_run,
        cache_dir: None,
    };
    compute_qrank(&config, None)?;

    info!("qrank-builder exiting");
    Ok(())
}
