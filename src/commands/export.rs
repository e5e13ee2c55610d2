// ABOUTME: export command - dumps the whole source table as normalized CSV
// ABOUTME: Reads through the SSH tunnel; never touches the destination

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::ReplicatorConfig;
use crate::export::export_csv;
use crate::source::MysqlSource;
use crate::tunnel::TunnelManager;

pub async fn export(config: &ReplicatorConfig, output: Option<&Path>) -> Result<()> {
    let manager = TunnelManager::new(
        config.bastion.as_ref(),
        &config.source.endpoint,
        config.tunnel_timeout,
    );
    let tunnel = manager.open().await?;

    let result = async {
        let mut source = MysqlSource::connect(&config.source, tunnel.endpoint()).await?;

        let writer: Box<dyn Write> = match output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            )),
            None => Box::new(BufWriter::new(std::io::stdout())),
        };

        let written =
            export_csv(&mut source, writer, config.batch_size, &config.region_code).await;
        if let Err(e) = source.disconnect().await {
            tracing::debug!("{:#}", e);
        }
        written
    }
    .await;

    if let Err(e) = tunnel.close().await {
        tracing::warn!("{:#}", e);
    }

    let written = result?;
    match output {
        Some(path) => tracing::info!("Exported {} records to {}", written, path.display()),
        None => tracing::info!("Exported {} records", written),
    }
    Ok(())
}
