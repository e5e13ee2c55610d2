// ABOUTME: PostgreSQL connection handling and destination table DDL
// ABOUTME: Connects over native-tls and creates fato_chamadas with its indexes

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

use crate::config::LoadMode;
use crate::utils::{retry_with_backoff, sanitize_url};

/// Destination table name.
pub const DESTINATION_TABLE: &str = "fato_chamadas";

/// Columns of the destination table, in insert order.
pub const DESTINATION_COLUMNS: [&str; 8] = [
    "data",
    "hora",
    "duracao",
    "fila",
    "holdtime",
    "teleatendente",
    "estado",
    "cob",
];

/// Connect to PostgreSQL.
///
/// TLS is negotiated according to the URL's `sslmode`; the connection task
/// is spawned onto the runtime and logs when it ends with an error.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect, retrying with exponential backoff while the server comes up.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 5, Duration::from_secs(2)).await
}

/// Create the destination table and its indexes if they do not exist.
///
/// With [`LoadMode::SkipDuplicates`] a unique index over the natural key is
/// added as well; creating it fails if the table already holds duplicates.
pub async fn ensure_schema(client: &Client, load_mode: LoadMode) -> Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS fato_chamadas (
                data DATE,
                hora TIME,
                duracao INTEGER,
                fila VARCHAR(10),
                holdtime INTEGER,
                teleatendente VARCHAR(100),
                estado INTEGER,
                cob VARCHAR(3)
            );
            CREATE INDEX IF NOT EXISTS idx_fato_chamadas_data ON fato_chamadas(data);
            CREATE INDEX IF NOT EXISTS idx_fato_chamadas_data_hora ON fato_chamadas(data, hora);
            CREATE INDEX IF NOT EXISTS idx_fato_chamadas_estado ON fato_chamadas(estado);",
        )
        .await
        .context("Failed to create destination table fato_chamadas")?;

    if load_mode == LoadMode::SkipDuplicates {
        client
            .batch_execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_fato_chamadas_natural_key
                 ON fato_chamadas(data, hora, teleatendente, fila)",
            )
            .await
            .context(
                "Failed to create unique index on fato_chamadas \
                 (remove existing duplicates or use --load-mode append)",
            )?;
    }

    tracing::debug!("Destination schema for {} is in place", DESTINATION_TABLE);
    Ok(())
}
