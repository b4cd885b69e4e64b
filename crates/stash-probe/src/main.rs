//! Stash probe - exercises a chunked blob stash against local files
//!
//! Every file named on the command line is streamed into the stash as
//! chunks, committed under a content hash tag and read back. A JSON summary
//! with the cache statistics is printed at the end.

mod error;
mod probe;

use crate::error::{ProbeError, Result};
use crate::probe::Summary;
use blob_stash::{ChunkCache, StashConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("stash_probe=info".parse()?)
        .add_directive("blob_stash=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        return Err(ProbeError::Config(
            "usage: stash-probe <file>...".to_string(),
        ));
    }

    // Load configuration from environment
    let config = StashConfig::from_env();
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );
    info!("Max entries: {}", config.max_entries);
    info!("Block size: {} bytes", config.block_size);

    tokio::fs::create_dir_all(&config.cache_dir).await?;
    let chunks = ChunkCache::from_config(&config)?;

    let chunk_size = config.block_size as u64;
    let mut reports = Vec::with_capacity(paths.len());
    for path in &paths {
        let mut report = probe::ingest_file(&chunks, path, chunk_size).await?;
        report.verified = match probe::verify_file(&chunks, &report).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(file = %report.file, error = %e, "Read-back failed");
                false
            }
        };
        reports.push(report);
    }

    let summary = Summary {
        files: reports,
        tracked_files: chunks.num_entries(),
        stats: chunks.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
