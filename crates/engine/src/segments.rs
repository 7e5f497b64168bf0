use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use itertools::Itertools;
use log::{debug, info, warn};
use parking_lot::Mutex;
use scopeguard::defer;

use crate::{
    error::{MaintenanceError, ReadError, RecoverError},
    metrics::Metrics,
    repo,
    segment::{ImmutableSegment, SegmentHeader, WritableSegment},
};

/// The set of frozen segments.
///
/// Kept ascending by id, which equals creation order; lookups scan in
/// reverse so the newest occurrence of a key wins. Compaction and merge are
/// serialized against each other by the maintenance mutex; lookups proceed
/// concurrently with both, because a segment's file is unlinked only after
/// the segment has left the set.
#[derive(Debug)]
pub struct Segments {
    inner: Mutex<Vec<Arc<ImmutableSegment>>>,
    maintenance: Mutex<()>,
    compacting: AtomicBool,
    data_dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl Segments {
    pub fn new(data_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            maintenance: Mutex::new(()),
            compacting: AtomicBool::new(false),
            data_dir,
            metrics,
        }
    }

    /// Insert `segment`, keeping the set ordered by id.
    pub fn add(&self, segment: Arc<ImmutableSegment>) {
        let mut inner = self.inner.lock();
        inner.push(segment);
        inner.sort_by(|a, b| a.id().cmp(b.id()));
        self.metrics.set_segment_count(inner.len() as u64);
    }

    /// Remove the segment named `id` from the set, returning it so the
    /// caller can unlink its file. `None` if no such segment.
    pub fn delete(&self, id: &str) -> Option<Arc<ImmutableSegment>> {
        let mut inner = self.inner.lock();
        let pos = inner.iter().position(|segment| segment.id() == id)?;
        let removed = inner.remove(pos);
        self.metrics.set_segment_count(inner.len() as u64);
        Some(removed)
    }

    pub fn sort(&self) {
        self.inner.lock().sort_by(|a, b| a.id().cmp(b.id()));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().iter().map(|s| s.id().to_owned()).collect()
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<ImmutableSegment>> {
        self.inner.lock().clone()
    }

    /// Rebuild every segment's index, one worker per segment.
    pub fn recover_all(&self) -> Result<(), RecoverError> {
        let segments = self.snapshot();
        thread::scope(|scope| {
            let workers = segments
                .iter()
                .map(|segment| scope.spawn(move || segment.recover_index()))
                .collect_vec();
            for worker in workers {
                worker.join().expect("recovery worker panicked")?;
            }
            Ok(())
        })
    }

    /// Look `key` up across the set, newest segment first.
    ///
    /// `NotFound` from one segment moves on to the next; any other error
    /// is fatal to the call.
    pub fn find(&self, key: &str) -> Result<Vec<u8>, ReadError> {
        for segment in self.snapshot().iter().rev() {
            match segment.read(key) {
                Ok(value) => return Ok(value),
                Err(ReadError::NotFound) => continue,
                Err(e) => {
                    warn!("segment {} read failed: {e}", segment.id());
                    return Err(e);
                }
            }
        }
        Err(ReadError::NotFound)
    }

    /// Rewrite every non-compacted segment down to one record per live key.
    ///
    /// Each rewrite keeps the latest value of every key the source segment
    /// holds, tombstones included. Segments are processed in parallel.
    pub fn compaction(&self) -> Result<(), MaintenanceError> {
        let _maintenance = self.maintenance.lock();

        let eligible = self
            .snapshot()
            .into_iter()
            .filter(|segment| !repo::is_compacted_name(segment.id()) && !segment.is_degraded())
            .collect_vec();
        if eligible.is_empty() {
            return Ok(());
        }

        info!("compacting {} segments", eligible.len());
        let start = Instant::now();
        self.compacting.store(true, Ordering::Release);
        defer! {
            self.compacting.store(false, Ordering::Release);
        }

        thread::scope(|scope| {
            let workers = eligible
                .iter()
                .map(|segment| scope.spawn(move || self.compact_one(segment)))
                .collect_vec();
            for worker in workers {
                worker.join().expect("compaction worker panicked")?;
            }
            Ok::<_, MaintenanceError>(())
        })?;

        self.metrics.record_compaction();
        info!("compaction done in {:.3}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    fn compact_one(&self, old: &ImmutableSegment) -> Result<(), MaintenanceError> {
        let name = repo::compact_name(old.id());
        let new = match WritableSegment::create(&self.data_dir, &name, SegmentHeader { is_compacted: true }) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Leftover from an interrupted rewrite; the source segment
                // is still authoritative, start over.
                warn!("removing stale compaction output {name}");
                fs::remove_file(self.data_dir.join(&name))?;
                WritableSegment::create(&self.data_dir, &name, SegmentHeader { is_compacted: true })?
            }
            other => other?,
        };

        for key in old.unique_keys() {
            let value = old.read(&key)?;
            new.write(&key, &value)?;
        }

        // The rewrite enters the set before its source leaves it, so a
        // concurrent lookup finds the key in one of the two; the file is
        // unlinked only once the source is out of the set.
        self.add(Arc::new(new.freeze()?));
        let removed = self
            .delete(old.id())
            .ok_or_else(|| MaintenanceError::SegmentVanished {
                segment: old.id().to_owned(),
            })?;
        fs::remove_file(removed.path())?;

        debug!("compacted segment {} into {name}", old.id());
        Ok(())
    }

    /// Fuse all compacted segments into a single fresh segment.
    ///
    /// Sources are drained oldest to newest, so a key present in several of
    /// them ends up with the value from the newest one. With fewer than two
    /// compacted segments there is nothing to fuse and no segment is
    /// created.
    pub fn merge(&self) -> Result<(), MaintenanceError> {
        let _maintenance = self.maintenance.lock();

        let compacted = self
            .snapshot()
            .into_iter()
            .filter(|segment| repo::is_compacted_name(segment.id()) && !segment.is_degraded())
            .collect_vec();
        if compacted.len() < 2 {
            return Ok(());
        }

        info!("merging {} compacted segments", compacted.len());
        let start = Instant::now();

        let new = WritableSegment::create(
            &self.data_dir,
            &repo::generate_segment_name(),
            SegmentHeader::default(),
        )?;
        for segment in &compacted {
            for key in segment.unique_keys() {
                let value = segment.read(&key)?;
                new.write(&key, &value)?;
            }
        }

        self.add(Arc::new(new.freeze()?));
        for segment in &compacted {
            let removed = self
                .delete(segment.id())
                .ok_or_else(|| MaintenanceError::SegmentVanished {
                    segment: segment.id().to_owned(),
                })?;
            fs::remove_file(removed.path())?;
        }

        self.metrics.record_merge();
        info!("merge done in {:.3}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TOMBSTONE;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    fn set(tmp: &TempDir) -> Segments {
        Segments::new(tmp.path().to_path_buf(), Arc::new(Metrics::new()))
    }

    fn frozen(tmp: &TempDir, entries: &[(&str, &[u8])]) -> Arc<ImmutableSegment> {
        let segment = WritableSegment::create(
            tmp.path(),
            &repo::generate_segment_name(),
            SegmentHeader::default(),
        )
        .unwrap();
        for (key, value) in entries {
            segment.write(key, value).unwrap();
        }
        Arc::new(segment.freeze().unwrap())
    }

    #[test]
    fn find_prefers_newest_segment() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(&tmp, &[("k", b"old"), ("only-old", b"1")]));
        segments.add(frozen(&tmp, &[("k", b"new")]));

        assert_eq!(segments.find("k").unwrap(), b"new");
        assert_eq!(segments.find("only-old").unwrap(), b"1");
        assert!(matches!(segments.find("missing"), Err(ReadError::NotFound)));
    }

    #[test]
    fn compaction_keeps_latest_value_per_key() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(
            &tmp,
            &[("k", b"1"), ("k", b"2"), ("other", b"x"), ("k", b"3")],
        ));
        let old_id = segments.ids().remove(0);

        segments.compaction().unwrap();

        assert_eq!(segments.len(), 1);
        let compacted = segments.snapshot().remove(0);
        assert_eq!(compacted.id(), repo::compact_name(&old_id));
        assert!(compacted.is_compacted());
        assert_eq!(compacted.key_count(), 2);
        assert_eq!(segments.find("k").unwrap(), b"3");
        assert_eq!(segments.find("other").unwrap(), b"x");
        assert!(!tmp.path().join(&old_id).exists());
    }

    #[test]
    fn compaction_skips_already_compacted() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(&tmp, &[("k", b"1")]));

        segments.compaction().unwrap();
        let ids = segments.ids();
        segments.compaction().unwrap();

        assert_eq!(segments.ids(), ids);
    }

    #[test]
    fn merge_takes_value_from_newest_source() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(&tmp, &[("k", b"old"), ("a", b"1")]));
        segments.add(frozen(&tmp, &[("k", b"new"), ("b", b"2")]));

        segments.compaction().unwrap();
        let source_ids = segments.ids();
        segments.merge().unwrap();

        assert_eq!(segments.len(), 1);
        let merged = segments.snapshot().remove(0);
        assert!(!repo::is_compacted_name(merged.id()));
        assert_eq!(merged.key_count(), 3);
        assert_eq!(segments.find("k").unwrap(), b"new");
        assert_eq!(segments.find("a").unwrap(), b"1");
        assert_eq!(segments.find("b").unwrap(), b"2");
        for id in source_ids {
            assert!(!tmp.path().join(id).exists());
        }
    }

    #[test]
    fn merge_needs_at_least_two_sources() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(&tmp, &[("k", b"1")]));

        segments.compaction().unwrap();
        let ids = segments.ids();
        segments.merge().unwrap();

        // Nothing to fuse: the set is unchanged and no file appeared.
        assert_eq!(segments.ids(), ids);
        assert_eq!(repo::existing_segments(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn tombstone_survives_compaction_and_merge() {
        let tmp = tempdir().unwrap();
        let segments = set(&tmp);
        segments.add(frozen(&tmp, &[("k", b"1"), ("k", TOMBSTONE)]));
        segments.add(frozen(&tmp, &[("other", b"x")]));

        segments.compaction().unwrap();
        assert_eq!(segments.find("k").unwrap(), TOMBSTONE);

        segments.merge().unwrap();
        assert_eq!(segments.find("k").unwrap(), TOMBSTONE);
    }

    #[test]
    fn segment_count_gauge_follows_set() {
        let tmp = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let segments = Segments::new(tmp.path().to_path_buf(), Arc::clone(&metrics));

        segments.add(frozen(&tmp, &[("a", b"1")]));
        segments.add(frozen(&tmp, &[("b", b"2")]));
        assert_eq!(metrics.snapshot().segment_count, 2);

        let id = segments.ids().remove(0);
        let removed = segments.delete(&id).unwrap();
        fs::remove_file(removed.path()).unwrap();
        assert_eq!(metrics.snapshot().segment_count, 1);
    }
}
