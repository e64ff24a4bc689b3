//! `listing-crawler [config-path]`
//!
//! Runs the crawl orchestrator until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use listing_crawler::Orchestrator;
use listing_crawler::infrastructure::{
    AppConfig, HtmlPageExtractor, JsonStatsSink, SqliteListingSink, init_logging_with_config, log_system_info,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    init_logging_with_config(&config.logging)?;
    log_system_info();

    let shutdown = CancellationToken::new();
    let settings = config.crawler.to_settings();

    let extractor = HtmlPageExtractor::new(&config.extractor, shutdown.clone())
        .context("Failed to build page extractor")?;
    let listing_sink = SqliteListingSink::connect(&config.storage.database_url)
        .await
        .context("Failed to open listing store")?;
    let stats_sink = JsonStatsSink::new(&config.storage.output_dir);

    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(extractor),
        Arc::new(listing_sink),
        Arc::new(stats_sink),
    )?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    orchestrator.start(shutdown).await;
    info!("Crawler stopped");
    Ok(())
}
