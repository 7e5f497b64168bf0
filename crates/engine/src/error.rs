use std::io;

use thiserror::Error;

/// Error yielded by point reads.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The key is absent, or its latest record is a tombstone.
    ///
    /// Within a single segment this is a control signal: the caller moves
    /// on to the next segment. Only the engine surfaces it to users.
    #[error("key not found")]
    NotFound,
    /// The index located a record, but its bytes cannot be interpreted.
    ///
    /// An index entry pointing at an unreadable record is an invariant
    /// violation; the affected segment is marked degraded but the engine
    /// remains usable.
    #[error(transparent)]
    Corrupt(#[from] CorruptRecord),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A record was located but failed validation.
#[derive(Debug, Error)]
pub enum CorruptRecord {
    #[error("record at offset {offset} of segment {segment} failed to decode")]
    Decode {
        segment: String,
        offset: u64,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("record at offset {offset} of segment {segment} has an empty key")]
    EmptyKey { segment: String, offset: u64 },
    #[error(
        "record at offset {offset} of segment {segment} holds key {actual:?}, expected {expected:?}"
    )]
    KeyMismatch {
        segment: String,
        offset: u64,
        expected: String,
        actual: String,
    },
}

/// Error rebuilding a segment's index from its file.
#[derive(Debug, Error)]
pub enum RecoverError {
    #[error(transparent)]
    Corrupt(#[from] CorruptRecord),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error during compaction or merge.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// A segment scheduled for rewrite was no longer in the set.
    #[error("segment {segment} vanished from the set")]
    SegmentVanished { segment: String },
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
