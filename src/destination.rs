// ABOUTME: Destination access for the sync engine
// ABOUTME: CallDestination trait plus its PostgreSQL implementation over tokio-postgres

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio_postgres::Client;

use crate::config::LoadMode;
use crate::load::LoadWriter;
use crate::model::{NormalizedCallRecord, Watermark};

/// The replicated table. Doubles as the store of replication progress.
#[async_trait]
pub trait CallDestination: Send {
    /// Newest (date, time) present: max date, then max time on that date.
    async fn newest(&mut self) -> Result<Watermark>;

    /// Whether a row with exactly this timestamp exists.
    async fn contains(&mut self, at: NaiveDateTime) -> Result<bool>;

    /// Whether any row is newer than `at`.
    async fn has_rows_after(&mut self, at: NaiveDateTime) -> Result<bool>;

    /// Append a page atomically, returning the number of rows inserted.
    async fn append(&mut self, rows: &[NormalizedCallRecord]) -> Result<u64>;
}

/// [`CallDestination`] backed by PostgreSQL.
pub struct PostgresDestination {
    client: Client,
    writer: LoadWriter,
}

impl PostgresDestination {
    pub fn new(client: Client, load_mode: LoadMode) -> Self {
        Self {
            client,
            writer: LoadWriter::new(load_mode),
        }
    }

    /// Connect to `url`.
    pub async fn connect(url: &str, load_mode: LoadMode) -> Result<Self> {
        let client = crate::postgres::connect(url)
            .await
            .context("Failed to connect to destination database")?;
        Ok(Self::new(client, load_mode))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Total rows in the destination table.
    pub async fn row_count(&self) -> Result<i64> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM fato_chamadas", &[])
            .await
            .context("Failed to count rows in fato_chamadas")?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl CallDestination for PostgresDestination {
    async fn newest(&mut self) -> Result<Watermark> {
        let row = self
            .client
            .query_one(
                "SELECT MAX(data), MAX(hora)
                 FROM fato_chamadas
                 WHERE data = (SELECT MAX(data) FROM fato_chamadas)",
                &[],
            )
            .await
            .context("Failed to read newest timestamp from fato_chamadas")?;

        let data: Option<NaiveDate> = row.get(0);
        let hora: Option<NaiveTime> = row.get(1);
        Ok(Watermark::from_parts(data, hora))
    }

    async fn contains(&mut self, at: NaiveDateTime) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM fato_chamadas WHERE data = $1 AND hora = $2)",
                &[&at.date(), &at.time()],
            )
            .await
            .context("Failed to look up checkpoint row in fato_chamadas")?;
        Ok(row.get(0))
    }

    async fn has_rows_after(&mut self, at: NaiveDateTime) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS(
                    SELECT 1 FROM fato_chamadas
                    WHERE data > $1 OR (data = $1 AND hora > $2)
                 )",
                &[&at.date(), &at.time()],
            )
            .await
            .context("Failed to look for rows newer than checkpoint in fato_chamadas")?;
        Ok(row.get(0))
    }

    async fn append(&mut self, rows: &[NormalizedCallRecord]) -> Result<u64> {
        self.writer.append(&mut self.client, rows).await
    }
}
