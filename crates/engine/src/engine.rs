use std::{
    collections::HashSet,
    fs, io, mem,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use crossbeam_channel::{bounded, select, tick, Sender};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    error::{MaintenanceError, ReadError, RecoverError},
    metrics::Metrics,
    repo,
    segment::{ImmutableSegment, SegmentHeader, WritableSegment},
    segments::Segments,
    Config, TOMBSTONE,
};

/// The storage engine: one active writable segment, a set of frozen ones,
/// and a background maintenance loop.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    /// The active segment. Swapped wholesale on rollover; operations clone
    /// the `Arc` out of the slot, so in-flight reads and writes complete
    /// against the segment they started with.
    active: Mutex<Arc<WritableSegment>>,
    segments: Arc<Segments>,
    /// Held for the duration of a rollover; `try_lock` failing means one is
    /// already in progress.
    rollover: Mutex<()>,
    maintenance: Mutex<Option<Maintenance>>,
}

#[derive(Debug)]
struct Maintenance {
    shutdown: Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Engine {
    /// Open the engine over `config.data_dir`.
    ///
    /// Enumerates and recovers every segment found on disk, runs one
    /// compaction + merge pass, then creates a fresh active segment and
    /// starts the maintenance loop.
    pub fn open(config: Config) -> io::Result<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let segments = Arc::new(Segments::new(
            config.data_dir.clone(),
            Arc::clone(&config.metrics),
        ));
        for path in startup_segment_files(&config.data_dir)? {
            segments.add(Arc::new(ImmutableSegment::open(path)?));
        }
        segments.sort();
        segments.recover_all().map_err(|e| match e {
            RecoverError::Io(e) => e,
            e @ RecoverError::Corrupt(_) => io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        // Startup maintenance failures are treated like any background
        // run: logged, and re-attempted on the next tick.
        if let Err(e) = segments.compaction() {
            warn!("startup compaction failed: {e}");
        }
        if let Err(e) = segments.merge() {
            warn!("startup merge failed: {e}");
        }

        let active = WritableSegment::create(
            &config.data_dir,
            &repo::generate_segment_name(),
            SegmentHeader::default(),
        )?;
        let maintenance = spawn_maintenance(&config, &segments)?;

        info!(
            "engine open over {} with {} frozen segments",
            config.data_dir.display(),
            segments.len()
        );
        Ok(Self {
            config,
            active: Mutex::new(Arc::new(active)),
            segments,
            rollover: Mutex::new(()),
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Look up the current value of `key`.
    ///
    /// Tries the active segment, then the frozen set from newest to
    /// oldest. A tombstone at any layer reads as `NotFound`.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, ReadError> {
        self.config.metrics.record_read();
        let active = Arc::clone(&self.active.lock());
        let value = match active.read(key) {
            Err(ReadError::NotFound) => self.segments.find(key)?,
            other => other?,
        };
        if value == TOMBSTONE {
            return Err(ReadError::NotFound);
        }
        Ok(value)
    }

    /// Durably append `key → value` to the active segment.
    pub fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.config.metrics.record_write();
        let active = Arc::clone(&self.active.lock());
        active.write(key, value)?;
        self.maybe_roll(&active)
    }

    /// Mark `key` as deleted by writing the tombstone value.
    pub fn delete(&self, key: &str) -> io::Result<()> {
        self.set(key, TOMBSTONE)
    }

    /// Run a compaction pass now, off the maintenance schedule.
    pub fn compact(&self) -> Result<(), MaintenanceError> {
        self.segments.compaction()
    }

    /// Run a merge pass now, off the maintenance schedule.
    pub fn merge(&self) -> Result<(), MaintenanceError> {
        self.segments.merge()
    }

    /// Names of the active and frozen segments, for diagnostics.
    pub fn segments_info(&self) -> SegmentsInfo {
        SegmentsInfo {
            active: self.active.lock().id().to_owned(),
            frozen: self.segments.ids(),
        }
    }

    /// The engine's counter sink, as handed in via [`Config`].
    pub fn metrics(&self) -> &Metrics {
        &self.config.metrics
    }

    /// Stop the maintenance loop. Idempotent; also runs on drop. File
    /// handles close when the engine is dropped.
    pub fn close(&self) {
        if let Some(maintenance) = self.maintenance.lock().take() {
            let _ = maintenance.shutdown.send(());
            if maintenance.thread.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }

    /// Freeze the active segment and swap in a fresh one once it has grown
    /// past the size threshold.
    ///
    /// Skipped while a compaction or another rollover is in progress.
    fn maybe_roll(&self, just_written: &Arc<WritableSegment>) -> io::Result<()> {
        if just_written.len() < self.config.segment_size_threshold {
            return Ok(());
        }
        if self.segments.is_compacting() {
            return Ok(());
        }
        let Some(_in_progress) = self.rollover.try_lock() else {
            return Ok(());
        };

        let mut active = self.active.lock();
        // Re-check under the slot lock: an earlier rollover may have
        // already swapped the segment out.
        if !Arc::ptr_eq(&active, just_written) || active.len() < self.config.segment_size_threshold {
            return Ok(());
        }

        let fresh = WritableSegment::create(
            &self.config.data_dir,
            &repo::generate_segment_name(),
            SegmentHeader::default(),
        )?;
        let old = mem::replace(&mut *active, Arc::new(fresh));
        // Keep the slot locked until the frozen twin is in the set, so no
        // lookup can miss the displaced segment's keys.
        self.segments.add(Arc::new(old.freeze()?));
        info!("froze segment {} at {} bytes", old.id(), old.len());
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the segments currently backing an engine.
#[derive(Clone, Debug, Serialize)]
pub struct SegmentsInfo {
    pub active: String,
    pub frozen: Vec<String>,
}

/// Segment files to load at startup.
///
/// A compacted rewrite whose source file still exists may be torn: the
/// source is unlinked only after the rewrite is complete and registered,
/// so the source stays authoritative and the rewrite is discarded.
fn startup_segment_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let all = repo::existing_segments(dir)?;
    let names: HashSet<String> = all
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    let mut keep = Vec::with_capacity(all.len());
    for path in all {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        match repo::compact_source(&name) {
            Some(source) if names.contains(source) => {
                warn!("discarding torn compaction output {name}");
                fs::remove_file(&path)?;
            }
            _ => keep.push(path),
        }
    }
    Ok(keep)
}

fn spawn_maintenance(config: &Config, segments: &Arc<Segments>) -> io::Result<Maintenance> {
    let ticker = tick(config.maintenance_interval);
    let (shutdown, signal) = bounded(1);
    let segments = Arc::clone(segments);
    let thread = thread::Builder::new()
        .name("segstore-maintenance".into())
        .spawn(move || loop {
            select! {
                recv(ticker) -> _ => {
                    if let Err(e) = segments.compaction() {
                        warn!("compaction failed: {e}");
                    }
                    if let Err(e) = segments.merge() {
                        warn!("merge failed: {e}");
                    }
                }
                recv(signal) -> _ => break,
            }
        })?;

    Ok(Maintenance { shutdown, thread })
}
