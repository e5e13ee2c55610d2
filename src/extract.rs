// ABOUTME: BatchExtractor pages call records out of the source with keyset pagination
// ABOUTME: Bulk mode starts from the beginning, incremental mode after the watermark

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::model::{RawCallRecord, Watermark};
use crate::source::CallSource;

/// Which kind of extraction a cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Destination is empty: copy the whole source.
    Bulk,
    /// Copy only rows strictly newer than the watermark.
    Incremental(NaiveDateTime),
}

impl ExtractMode {
    pub fn for_watermark(watermark: Watermark) -> Self {
        match watermark {
            Watermark::Empty => ExtractMode::Bulk,
            Watermark::At(ts) => ExtractMode::Incremental(ts),
        }
    }
}

/// Iterates over the source in ascending `datahora` order, one page at a time.
///
/// Pages are anchored on the last `datahora` returned rather than a numeric
/// offset, so rows inserted concurrently cannot shift later pages. A page
/// never splits a group of rows sharing one timestamp: when a full page ends
/// in such a group, the group is dropped from the tail and re-read whole.
/// A page can therefore be shorter or longer than `batch_size`.
#[derive(Debug, Clone)]
pub struct BatchExtractor {
    cursor: Option<NaiveDateTime>,
    batch_size: usize,
    pages: u64,
    rows: u64,
    exhausted: bool,
}

impl BatchExtractor {
    pub fn new(mode: ExtractMode, batch_size: usize) -> Self {
        let cursor = match mode {
            ExtractMode::Bulk => None,
            ExtractMode::Incremental(ts) => Some(ts),
        };
        Self {
            cursor,
            batch_size: batch_size.max(1),
            pages: 0,
            rows: 0,
            exhausted: false,
        }
    }

    /// Timestamp of the last row handed out so far.
    pub fn cursor(&self) -> Option<NaiveDateTime> {
        self.cursor
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Fetch the next page, or `None` once the source is drained.
    pub async fn next_page<S>(&mut self, source: &mut S) -> Result<Option<Vec<RawCallRecord>>>
    where
        S: CallSource + ?Sized,
    {
        if self.exhausted {
            return Ok(None);
        }

        let mut page = source.fetch_after(self.cursor, self.batch_size).await?;

        if page.len() < self.batch_size {
            self.exhausted = true;
        } else if let Some(boundary) = page.last().map(|r| r.datahora) {
            let keep = page
                .iter()
                .rposition(|r| r.datahora != boundary)
                .map_or(0, |idx| idx + 1);
            page.truncate(keep);
            page.extend(source.fetch_at(boundary).await?);
        }

        let Some(last) = page.last().map(|r| r.datahora) else {
            self.exhausted = true;
            return Ok(None);
        };

        self.cursor = Some(last);
        self.pages += 1;
        self.rows += page.len() as u64;
        Ok(Some(page))
    }
}
