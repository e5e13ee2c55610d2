// ABOUTME: Library root for call-replicator
// ABOUTME: Replicates call-center records from a tunneled MySQL source into PostgreSQL

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod destination;
pub mod export;
pub mod extract;
pub mod load;
pub mod model;
pub mod postgres;
pub mod scheduler;
pub mod source;
pub mod transform;
pub mod tunnel;
pub mod utils;
pub mod watermark;

pub use config::{LoadMode, ReplicatorArgs, ReplicatorConfig};
pub use model::{NormalizedCallRecord, RawCallRecord, Watermark};
pub use scheduler::{replicate, CycleStats, SyncScheduler};
