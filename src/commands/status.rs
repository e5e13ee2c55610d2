// ABOUTME: status command - reports replication progress of the destination
// ABOUTME: Prints the resolved watermark and the destination row count

use anyhow::Result;

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicatorConfig;
use crate::destination::PostgresDestination;
use crate::watermark::WatermarkResolver;

pub async fn status(config: &ReplicatorConfig) -> Result<()> {
    let mut destination =
        PostgresDestination::connect(&config.destination_url, config.load_mode).await?;

    let checkpoint = config.checkpoint_path.clone().map(CheckpointStore::new);
    let resolver = WatermarkResolver::new(&config.destination_url, checkpoint);
    let watermark = resolver.resolve(&mut destination).await;
    let rows = destination.row_count().await?;

    println!("========================================");
    println!("Replication status");
    println!("========================================");
    println!("  Watermark: {}", watermark);
    println!("  Rows in fato_chamadas: {}", rows);
    if let Some(path) = &config.checkpoint_path {
        println!("  Checkpoint file: {}", path.display());
    }
    Ok(())
}
