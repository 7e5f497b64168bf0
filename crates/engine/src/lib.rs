//! A log-structured, append-only key-value storage engine.
//!
//! Writes land in the *active* segment, an append-only file paired with an
//! in-memory index mapping each key to the byte offset of its latest record.
//! When the active segment grows past a size threshold it is frozen and a
//! fresh one takes its place. Point reads consult the active segment first,
//! then fan out over the frozen segments from newest to oldest.
//!
//! Background maintenance periodically rewrites each frozen segment to one
//! record per live key (compaction) and fuses the compacted segments into a
//! single segment (merge). Deletion is a write of the reserved [`TOMBSTONE`]
//! value; a key whose latest record is a tombstone reads as not found.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod engine;
mod repo;
mod segments;

pub mod error;
pub mod index;
pub mod metrics;
pub mod record;
pub mod segment;

pub use crate::{
    engine::{Engine, SegmentsInfo},
    record::Record,
};

/// Reserved value marking a key as deleted.
///
/// A record carrying these bytes is retained in the log like any other
/// write, but [`Engine::get`] reports the key as not found. The marker
/// survives compaction and merge.
pub const TOMBSTONE: &[u8] = b"$__TOMBSTONE__$";

/// [`Engine`] configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory in which segment files are stored.
    ///
    /// Created if it does not exist. Must not be shared between engines.
    pub data_dir: PathBuf,
    /// Size in bytes past which the active segment is frozen and replaced.
    ///
    /// Default: 32 MiB.
    pub segment_size_threshold: u64,
    /// Interval between background compaction + merge runs.
    ///
    /// Default: 5 minutes.
    pub maintenance_interval: Duration,
    /// Sink for the engine's operation counters.
    ///
    /// Pass a shared handle to observe the counters externally. A fresh
    /// sink is allocated by [`Config::new`].
    pub metrics: Arc<metrics::Metrics>,
}

impl Config {
    pub const DEFAULT_SEGMENT_SIZE_THRESHOLD: u64 = 32 * 1024 * 1024;
    pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Configuration with defaults for everything but the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            segment_size_threshold: Self::DEFAULT_SEGMENT_SIZE_THRESHOLD,
            maintenance_interval: Self::DEFAULT_MAINTENANCE_INTERVAL,
            metrics: Arc::new(metrics::Metrics::default()),
        }
    }
}
