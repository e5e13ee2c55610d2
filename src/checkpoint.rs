// ABOUTME: Optional persisted watermark for incremental syncs
// ABOUTME: Saves the last committed timestamp as JSON so cycles can skip the MAX() scan

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::utils::sanitize_url;

/// On-disk checkpoint contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Destination the checkpoint belongs to (password masked)
    pub destination: String,
    /// Timestamp of the newest committed row
    pub last_datahora: NaiveDateTime,
    /// Rows committed by the page that produced this checkpoint
    pub last_batch_rows: u64,
    /// Version of the file format
    pub version: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn new(destination_url: &str, last_datahora: NaiveDateTime, last_batch_rows: u64) -> Self {
        Self {
            destination: sanitize_url(destination_url),
            last_datahora,
            last_batch_rows,
            version: 1,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Whether this checkpoint was written for `destination_url`.
    pub fn belongs_to(&self, destination_url: &str) -> bool {
        self.destination == sanitize_url(destination_url)
    }
}

/// Reads and writes a [`Checkpoint`] file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or `None` if the file does not exist yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read checkpoint from {:?}", self.path))?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoint from {:?}", self.path))?;
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint, replacing the previous file atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write checkpoint to {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to move checkpoint into {:?}", self.path))?;
        Ok(())
    }
}
