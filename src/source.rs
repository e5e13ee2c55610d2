// ABOUTME: Read access to the remote call-record table
// ABOUTME: CallSource trait plus its MySQL implementation over mysql_async

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row};

use crate::config::{Endpoint, SourceConfig};
use crate::model::RawCallRecord;
use crate::transform::{datetime_to_value, SOURCE_COLUMNS};
use crate::utils::quote_mysql_ident;

/// Keyset-ordered reads of call records.
///
/// Every method returns rows ordered ascending by `datahora` and skips rows
/// whose `datahora` is NULL.
#[async_trait]
pub trait CallSource: Send {
    /// Number of rows the fetch methods can return (NULL `datahora` excluded).
    async fn count(&mut self) -> Result<u64>;

    /// Up to `limit` rows with `datahora` strictly after `after` (or from the
    /// beginning when `after` is `None`).
    async fn fetch_after(
        &mut self,
        after: Option<NaiveDateTime>,
        limit: usize,
    ) -> Result<Vec<RawCallRecord>>;

    /// Every row whose `datahora` equals `at`.
    async fn fetch_at(&mut self, at: NaiveDateTime) -> Result<Vec<RawCallRecord>>;
}

/// [`CallSource`] backed by a MySQL connection.
pub struct MysqlSource {
    conn: Conn,
    table: String,
}

impl MysqlSource {
    /// Connect to the source database at `endpoint` (usually a tunnel's local end).
    pub async fn connect(config: &SourceConfig, endpoint: &Endpoint) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(config.user.clone()))
            .pass(config.password.clone())
            .db_name(Some(config.database.clone()));

        let conn = Conn::new(opts).await.with_context(|| {
            format!(
                "Failed to connect to source database {} at {}",
                config.database, endpoint
            )
        })?;

        Ok(Self {
            conn,
            table: quote_mysql_ident(&config.table),
        })
    }

    /// Close the connection gracefully.
    pub async fn disconnect(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .context("Failed to close source connection")
    }

    fn select_list() -> String {
        SOURCE_COLUMNS
            .iter()
            .map(|c| quote_mysql_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rows without a `datahora` are never fetched, so they are not counted.
    fn count_query(table: &str) -> String {
        format!("SELECT COUNT(`datahora`) FROM {}", table)
    }

    fn decode_rows(rows: Vec<Row>) -> Result<Vec<RawCallRecord>> {
        rows.iter().map(RawCallRecord::from_row).collect()
    }
}

#[async_trait]
impl CallSource for MysqlSource {
    async fn count(&mut self) -> Result<u64> {
        let total: Option<u64> = self
            .conn
            .query_first(Self::count_query(&self.table))
            .await
            .with_context(|| format!("Failed to count rows in {}", self.table))?;
        Ok(total.unwrap_or(0))
    }

    async fn fetch_after(
        &mut self,
        after: Option<NaiveDateTime>,
        limit: usize,
    ) -> Result<Vec<RawCallRecord>> {
        let rows: Vec<Row> = match after {
            Some(cursor) => {
                let query = format!(
                    "SELECT {} FROM {} WHERE `datahora` > ? ORDER BY `datahora` LIMIT ?",
                    Self::select_list(),
                    self.table
                );
                tracing::debug!("Fetching up to {} rows after {}", limit, cursor);
                self.conn
                    .exec::<Row, _, _>(query, (datetime_to_value(&cursor), limit as u64))
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM {} WHERE `datahora` IS NOT NULL ORDER BY `datahora` LIMIT ?",
                    Self::select_list(),
                    self.table
                );
                tracing::debug!("Fetching first {} rows", limit);
                self.conn.exec::<Row, _, _>(query, (limit as u64,)).await
            }
        }
        .with_context(|| format!("Failed to read page from {}", self.table))?;

        Self::decode_rows(rows)
    }

    async fn fetch_at(&mut self, at: NaiveDateTime) -> Result<Vec<RawCallRecord>> {
        let query = format!(
            "SELECT {} FROM {} WHERE `datahora` = ?",
            Self::select_list(),
            self.table
        );
        let rows: Vec<Row> = self
            .conn
            .exec::<Row, _, _>(query, (datetime_to_value(&at),))
            .await
            .with_context(|| format!("Failed to read rows at {} from {}", at, self.table))?;

        Self::decode_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_list_quotes_columns() {
        assert_eq!(
            MysqlSource::select_list(),
            "`datahora`, `duracao`, `fila`, `holdtime`, `teleatendente`, `estado`"
        );
    }

    #[test]
    fn test_count_skips_rows_without_datahora() {
        assert_eq!(
            MysqlSource::count_query("`meso_detalhe`"),
            "SELECT COUNT(`datahora`) FROM `meso_detalhe`"
        );
    }
}
