// ABOUTME: init-schema command - creates the destination table and indexes
// ABOUTME: Waits for the destination to accept connections before running DDL

use anyhow::{Context, Result};

use crate::config::ReplicatorConfig;
use crate::postgres::{connect_with_retry, ensure_schema, DESTINATION_TABLE};
use crate::utils::sanitize_url;

pub async fn init_schema(config: &ReplicatorConfig) -> Result<()> {
    tracing::info!(
        "Checking destination connection {}",
        sanitize_url(&config.destination_url)
    );
    let client = connect_with_retry(&config.destination_url)
        .await
        .context("Destination database is not reachable")?;
    ensure_schema(&client, config.load_mode).await?;

    println!("Destination table {} is ready", DESTINATION_TABLE);
    Ok(())
}
