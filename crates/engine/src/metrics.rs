//! Operation counters.
//!
//! The engine writes to whatever [`Metrics`] handle its configuration
//! carries; an exporter (prometheus, logs, a test) reads snapshots from the
//! same handle. No process-wide globals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a running engine.
#[derive(Debug, Default)]
pub struct Metrics {
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    total_compactions: AtomicU64,
    total_merges: AtomicU64,
    segment_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.total_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self) {
        self.total_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauge: current number of frozen segments.
    pub(crate) fn set_segment_count(&self, count: u64) {
        self.segment_count.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_compactions: self.total_compactions.load(Ordering::Relaxed),
            total_merges: self.total_merges.load(Ordering::Relaxed),
            segment_count: self.segment_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_compactions: u64,
    pub total_merges: u64,
    pub segment_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_read();
        metrics.record_read();
        metrics.record_write();
        metrics.set_segment_count(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_reads, 2);
        assert_eq!(snap.total_writes, 1);
        assert_eq!(snap.segment_count, 3);
        assert_eq!(snap.total_compactions, 0);
    }
}
