// ABOUTME: Data model for replicated call records and the replication watermark
// ABOUTME: Raw source rows, normalized destination rows, and the cursor between them

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::fmt;

/// A call event as stored in the remote source table.
///
/// Produced and owned by the upstream system; this crate only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCallRecord {
    /// When the call happened (`datahora`)
    pub datahora: NaiveDateTime,
    /// Call duration in whole seconds (`duracao`)
    pub duracao: Option<i32>,
    /// Queue code (`fila`)
    pub fila: Option<String>,
    /// Time on hold in whole seconds (`holdtime`)
    pub holdtime: Option<i32>,
    /// Agent identifier (`teleatendente`)
    pub teleatendente: Option<String>,
    /// Call outcome as free text (`estado`)
    pub estado: Option<String>,
}

/// A row of the destination `fato_chamadas` table.
///
/// Field order matches the destination column order and the CSV export header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedCallRecord {
    pub data: NaiveDate,
    pub hora: NaiveTime,
    pub duracao: i32,
    pub fila: Option<String>,
    pub holdtime: i32,
    pub teleatendente: Option<String>,
    pub estado: i32,
    pub cob: String,
}

impl NormalizedCallRecord {
    /// Timestamp of the call, recombined from `data` and `hora`.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.data.and_time(self.hora)
    }
}

/// Replication progress: the timestamp of the newest record already in the
/// destination.
///
/// Never stored on its own in the default setup; it is recomputed from the
/// destination table at the start of every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Destination holds no rows (or could not be inspected).
    Empty,
    /// Newest replicated record timestamp.
    At(NaiveDateTime),
}

impl Watermark {
    /// Sentinel timestamp standing for an empty destination in logs.
    pub fn sentinel() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(NaiveDateTime::MIN)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Watermark::Empty)
    }

    /// The cursor from which extraction continues, if any.
    pub fn cursor(&self) -> Option<NaiveDateTime> {
        match self {
            Watermark::Empty => None,
            Watermark::At(ts) => Some(*ts),
        }
    }

    /// Build a watermark from the destination's newest (date, time), if any.
    pub fn from_parts(data: Option<NaiveDate>, hora: Option<NaiveTime>) -> Self {
        match (data, hora) {
            (Some(data), Some(hora)) => Watermark::At(data.and_time(hora)),
            _ => Watermark::Empty,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Empty => write!(f, "{} (empty destination)", Self::sentinel()),
            Watermark::At(ts) => write!(f, "{}", ts),
        }
    }
}
