// ABOUTME: sync command - runs replication once or continuously
// ABOUTME: Prepares the destination, then hands control to the SyncScheduler

use anyhow::{Context, Result};

use crate::config::ReplicatorConfig;
use crate::postgres::{connect_with_retry, ensure_schema};
use crate::scheduler::SyncScheduler;
use crate::utils::sanitize_url;

pub async fn sync(config: ReplicatorConfig, once: bool) -> Result<()> {
    tracing::info!(
        "Waiting for destination database {}",
        sanitize_url(&config.destination_url)
    );
    let client = connect_with_retry(&config.destination_url)
        .await
        .context("Destination database is not reachable")?;
    ensure_schema(&client, config.load_mode).await?;
    drop(client);

    tracing::info!("Source: {}.{}", config.source.database, config.source.table);
    match &config.bastion {
        Some(bastion) => tracing::info!("SSH bastion: {}@{}", bastion.user, bastion.endpoint),
        None => tracing::info!("No SSH bastion, connecting to {} directly", config.source.endpoint),
    }
    tracing::info!("Batch size: {}", config.batch_size);
    tracing::info!("Region code: {}", config.region_code);
    if let Some(path) = &config.checkpoint_path {
        tracing::info!("Checkpoint file: {:?}", path);
    }

    let scheduler = SyncScheduler::new(config);

    if once {
        tracing::info!("Running single sync cycle...");
        let stats = scheduler.run_cycle().await?;

        println!();
        println!("========================================");
        println!("Sync cycle complete");
        println!("========================================");
        println!("  Mode: {:?}", stats.mode);
        println!("  Watermark before: {}", stats.watermark_before);
        println!("  Pages: {}", stats.pages);
        println!("  Rows extracted: {}", stats.rows_extracted);
        println!("  Rows loaded: {}", stats.rows_loaded);
        println!("  Duration: {}ms", stats.duration_ms);
        return Ok(());
    }

    tracing::info!("Starting continuous sync...");
    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    let result = scheduler.run(shutdown_rx).await;
    drop(shutdown_tx);
    result
}
