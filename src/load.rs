// ABOUTME: LoadWriter appends normalized call records to the destination table
// ABOUTME: Multi-row INSERTs inside one transaction per page, append-only by default

use anyhow::{Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::config::LoadMode;
use crate::model::NormalizedCallRecord;
use crate::postgres::{DESTINATION_COLUMNS, DESTINATION_TABLE};
use crate::utils::quote_ident;

/// PostgreSQL allows at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65_000;

/// Writes pages of [`NormalizedCallRecord`] to `fato_chamadas`.
///
/// Delivery is at-least-once. In [`LoadMode::Append`] nothing stops the same
/// call from being inserted twice: a watermark query that fails is treated
/// as an empty destination, and the bulk load that follows re-inserts every
/// row already present. [`LoadMode::SkipDuplicates`] closes that gap with
/// `ON CONFLICT DO NOTHING` on the natural key.
#[derive(Debug, Clone, Copy)]
pub struct LoadWriter {
    mode: LoadMode,
}

impl LoadWriter {
    pub fn new(mode: LoadMode) -> Self {
        Self { mode }
    }

    /// Append a page. Either all of it is committed or none of it is.
    ///
    /// Returns the number of rows inserted, which is lower than `rows.len()`
    /// only when duplicates were skipped.
    pub async fn append(&self, client: &mut Client, rows: &[NormalizedCallRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let rows_per_statement = std::cmp::max(1, MAX_PARAMS / DESTINATION_COLUMNS.len());

        let transaction = client
            .transaction()
            .await
            .context("Failed to start load transaction")?;

        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_statement) {
            let query = build_insert_query(chunk.len(), self.mode);
            let params: Vec<&(dyn ToSql + Sync)> =
                chunk.iter().flat_map(|row| row_params(row)).collect();

            inserted += transaction
                .execute(query.as_str(), &params)
                .await
                .with_context(|| {
                    format!(
                        "Failed to insert {} rows into {}",
                        chunk.len(),
                        DESTINATION_TABLE
                    )
                })?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit load transaction")?;

        if inserted < rows.len() as u64 {
            tracing::info!(
                "Skipped {} duplicate rows already present in {}",
                rows.len() as u64 - inserted,
                DESTINATION_TABLE
            );
        }

        Ok(inserted)
    }
}

fn row_params(row: &NormalizedCallRecord) -> [&(dyn ToSql + Sync); 8] {
    [
        &row.data,
        &row.hora,
        &row.duracao,
        &row.fila,
        &row.holdtime,
        &row.teleatendente,
        &row.estado,
        &row.cob,
    ]
}

/// Build a multi-row INSERT for `num_rows` rows.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "fato_chamadas" ("data", "hora", ...)
/// VALUES ($1, $2, ...), ($9, $10, ...)
/// ```
/// with `ON CONFLICT (...) DO NOTHING` appended in skip-duplicates mode.
fn build_insert_query(num_rows: usize, mode: LoadMode) -> String {
    let quoted_columns: Vec<String> = DESTINATION_COLUMNS.iter().map(|c| quote_ident(c)).collect();

    let num_cols = DESTINATION_COLUMNS.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let mut query = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(DESTINATION_TABLE),
        quoted_columns.join(", "),
        value_rows.join(", ")
    );

    if mode == LoadMode::SkipDuplicates {
        query.push_str(" ON CONFLICT (\"data\", \"hora\", \"teleatendente\", \"fila\") DO NOTHING");
    }

    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_insert_query_single_row() {
        let query = build_insert_query(1, LoadMode::Append);
        assert_eq!(
            query,
            "INSERT INTO \"fato_chamadas\" (\"data\", \"hora\", \"duracao\", \"fila\", \
             \"holdtime\", \"teleatendente\", \"estado\", \"cob\") \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
    }

    #[test]
    fn test_build_insert_query_numbers_placeholders_across_rows() {
        let query = build_insert_query(2, LoadMode::Append);
        assert!(query.ends_with("($1, $2, $3, $4, $5, $6, $7, $8), ($9, $10, $11, $12, $13, $14, $15, $16)"));
        assert!(!query.contains("ON CONFLICT"));
    }

    #[test]
    fn test_build_insert_query_skip_duplicates() {
        let query = build_insert_query(1, LoadMode::SkipDuplicates);
        assert!(query.ends_with(
            "ON CONFLICT (\"data\", \"hora\", \"teleatendente\", \"fila\") DO NOTHING"
        ));
    }

    #[test]
    fn test_statement_chunk_fits_parameter_limit() {
        let rows_per_statement = MAX_PARAMS / DESTINATION_COLUMNS.len();
        assert!(rows_per_statement * DESTINATION_COLUMNS.len() <= 65_535);
        assert!(rows_per_statement >= 1000);
    }
}
