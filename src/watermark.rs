// ABOUTME: WatermarkResolver derives how far replication has progressed
// ABOUTME: Reads the destination's newest row, optionally short-cut by a verified checkpoint

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::destination::CallDestination;
use crate::model::Watermark;

/// Resolves the replication cursor at the start of each cycle.
///
/// The destination table is the source of truth. When a checkpoint store is
/// configured, its value is used only after two index lookups confirm it: the
/// checkpointed row exists and nothing newer does. Anything else falls back
/// to scanning the destination.
#[derive(Debug, Clone)]
pub struct WatermarkResolver {
    destination_url: String,
    checkpoint: Option<CheckpointStore>,
}

impl WatermarkResolver {
    pub fn new(destination_url: &str, checkpoint: Option<CheckpointStore>) -> Self {
        Self {
            destination_url: destination_url.to_string(),
            checkpoint,
        }
    }

    /// Resolve the current watermark.
    ///
    /// Never fails: an unreadable destination resolves to
    /// [`Watermark::Empty`], the same as an empty one, so the caller cannot
    /// tell the two apart.
    pub async fn resolve<D>(&self, destination: &mut D) -> Watermark
    where
        D: CallDestination + ?Sized,
    {
        if let Some(ts) = self.verified_checkpoint(destination).await {
            tracing::debug!("Using checkpointed watermark {}", ts);
            return Watermark::At(ts);
        }

        match destination.newest().await {
            Ok(watermark) => watermark,
            Err(e) => {
                tracing::warn!(
                    "Could not read watermark from destination, treating it as empty: {:#}",
                    e
                );
                Watermark::Empty
            }
        }
    }

    /// Record that every row up to `last` is committed.
    pub async fn commit(&self, last: NaiveDateTime, batch_rows: u64) -> Result<()> {
        if let Some(store) = &self.checkpoint {
            store
                .save(&Checkpoint::new(&self.destination_url, last, batch_rows))
                .await?;
        }
        Ok(())
    }

    async fn verified_checkpoint<D>(&self, destination: &mut D) -> Option<NaiveDateTime>
    where
        D: CallDestination + ?Sized,
    {
        let store = self.checkpoint.as_ref()?;

        let checkpoint = match store.load().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Ignoring unreadable checkpoint {:?}: {:#}", store.path(), e);
                return None;
            }
        };

        if !checkpoint.belongs_to(&self.destination_url) {
            tracing::warn!(
                "Checkpoint {:?} was written for {}, ignoring it",
                store.path(),
                checkpoint.destination
            );
            return None;
        }

        let ts = checkpoint.last_datahora;
        match self.confirm(destination, ts).await {
            Ok(true) => Some(ts),
            Ok(false) => {
                tracing::warn!(
                    "Checkpoint {} does not match the destination, rescanning",
                    ts
                );
                None
            }
            Err(e) => {
                tracing::warn!("Could not verify checkpoint {}: {:#}", ts, e);
                None
            }
        }
    }

    async fn confirm<D>(&self, destination: &mut D, ts: NaiveDateTime) -> Result<bool>
    where
        D: CallDestination + ?Sized,
    {
        Ok(destination.contains(ts).await? && !destination.has_rows_after(ts).await?)
    }
}
