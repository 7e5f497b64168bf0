use std::{
    fs::{self, File},
    io::{self, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    error::{CorruptRecord, ReadError, RecoverError},
    index::SegmentIndex,
    record::{self, Record},
};

/// First byte of every segment file.
pub const MAGIC: u8 = 218;

/// Fixed-size header at the start of every segment file.
///
/// Byte 0 is the magic number, bit 0 of byte 1 records whether the segment
/// is the output of compaction. The remaining bytes are reserved, zeroed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SegmentHeader {
    pub is_compacted: bool,
}

impl SegmentHeader {
    pub const LEN: usize = 1024;

    pub fn write<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        let mut buf = [0u8; Self::LEN];
        buf[0] = MAGIC;
        buf[1] = self.is_compacted as u8;
        out.write_all(&buf)
    }

    pub fn decode<R: io::Read>(mut read: R) -> io::Result<Self> {
        let mut buf = [0; Self::LEN];
        read.read_exact(&mut buf)?;

        if buf[0] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment header does not start with magic",
            ));
        }

        Ok(Self {
            is_compacted: buf[1] & 1 == 1,
        })
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// State shared by both segment kinds: the read handle, the parsed header
/// and the offset index.
///
/// Reads are positional (read-at-offset), so they never touch the handle's
/// cursor and need no lock of their own.
#[derive(Debug)]
struct SegmentCore {
    id: String,
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    index: Arc<SegmentIndex>,
    degraded: AtomicBool,
}

impl SegmentCore {
    /// Read the framed record starting at `offset`.
    fn record_at(&self, offset: u64) -> io::Result<Vec<u8>> {
        let mut prefix = [0u8; record::PREFIX_LEN];
        read_exact_at(&self.file, &mut prefix, offset)?;
        let len = u64::from_le_bytes(prefix);
        let mut body = vec![0u8; len as usize];
        read_exact_at(&self.file, &mut body, offset + record::PREFIX_LEN as u64)?;
        Ok(body)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, ReadError> {
        let entry = self.index.get(key).ok_or(ReadError::NotFound)?;
        // From here on the index vouches for a record at this offset, so
        // any failure is an invariant violation.
        let body = self.record_at(entry.offset).inspect_err(|e| {
            self.mark_degraded(entry.offset, e);
        })?;
        let record = Record::decode_validated(&self.id, entry.offset, &body, Some(key)).inspect_err(|e| {
            self.mark_degraded(entry.offset, e);
        })?;
        Ok(record.value)
    }

    fn mark_degraded(&self, offset: u64, cause: &dyn std::fmt::Display) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(
            "segment {}: index points at unreadable record at offset {offset}: {cause}",
            self.id
        );
    }

    /// Rebuild the index by a sequential pass over the segment file.
    ///
    /// Later occurrences of a key overwrite earlier ones, so the index ends
    /// up pointing at the latest record per key. End-of-file at a record
    /// boundary terminates the pass; a short read mid-record is a truncated
    /// tail and is surfaced as an error. Records with an empty key are
    /// skipped, not indexed.
    fn recover_index(&self) -> Result<usize, RecoverError> {
        let start = Instant::now();
        debug!("recovering index of segment {}", self.id);

        // A fresh handle, so concurrent positional reads are unaffected
        // and the pass can be buffered.
        let mut reader = BufReader::new(File::open(&self.path)?);
        SegmentHeader::decode(&mut reader)?;

        let mut pos = SegmentHeader::LEN as u64;
        let mut count = 0usize;
        while let Some(body) = record::read_framed(&mut reader)? {
            match Record::decode_validated(&self.id, pos, &body, None) {
                Ok(record) => self.index.set(record.key, pos, record.creation_time),
                Err(e @ CorruptRecord::EmptyKey { .. }) => {
                    warn!("segment {}: skipping record: {e}", self.id)
                }
                Err(e) => return Err(e.into()),
            }
            pos += (record::PREFIX_LEN + body.len()) as u64;
            count += 1;
        }

        info!(
            "recovered segment {}: {count} records in {}ms",
            self.id,
            start.elapsed().as_millis()
        );
        Ok(count)
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            id: self.id.clone(),
            path: self.path.clone(),
            file: self.file.try_clone()?,
            header: self.header,
            index: Arc::clone(&self.index),
            degraded: AtomicBool::new(self.degraded.load(Ordering::Relaxed)),
        })
    }
}

/// A segment no longer accepting writes.
#[derive(Debug)]
pub struct ImmutableSegment {
    core: SegmentCore,
}

impl ImmutableSegment {
    /// Open an existing segment file, validating its header. The index
    /// starts empty; call [`Self::recover_index`] to populate it.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let id = segment_id(&path)?;
        let file = File::open(&path)?;
        let header = SegmentHeader::decode(&file)?;

        Ok(Self {
            core: SegmentCore {
                id,
                path,
                file,
                header,
                index: Arc::new(SegmentIndex::new()),
                degraded: AtomicBool::new(false),
            },
        })
    }

    /// Point read. `NotFound` only consults the in-memory index; everything
    /// else touches the file.
    pub fn read(&self, key: &str) -> Result<Vec<u8>, ReadError> {
        self.core.read(key)
    }

    pub fn recover_index(&self) -> Result<usize, RecoverError> {
        self.core.recover_index()
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn unique_keys(&self) -> Vec<String> {
        self.core.index.all_keys()
    }

    pub fn key_count(&self) -> usize {
        self.core.index.len()
    }

    pub fn file_info(&self) -> io::Result<fs::Metadata> {
        self.core.file.metadata()
    }

    pub fn is_compacted(&self) -> bool {
        self.core.header.is_compacted
    }

    /// `true` once a read found the index pointing at an unreadable record.
    pub fn is_degraded(&self) -> bool {
        self.core.degraded.load(Ordering::Relaxed)
    }

    /// Close the read handle. The file itself stays on disk.
    pub fn close(self) {
        debug!("closing segment {}", self.core.id);
    }
}

/// The active segment: an append-only writer plus the shared read path.
#[derive(Debug)]
pub struct WritableSegment {
    core: SegmentCore,
    /// Append handle. The mutex serializes offset capture, the frame write
    /// and the index insert.
    append: Mutex<File>,
    /// Bytes in the file, header included.
    len: AtomicU64,
}

impl WritableSegment {
    /// Create a fresh segment file named `name` under `dir` and eagerly
    /// write its header.
    pub fn create(dir: &Path, name: &str, header: SegmentHeader) -> io::Result<Self> {
        let path = dir.join(name);
        let append = File::options().append(true).create_new(true).open(&path)?;
        header.write(&append)?;
        let file = File::open(&path)?;

        debug!("created segment {name}");
        Ok(Self {
            core: SegmentCore {
                id: name.to_owned(),
                path,
                file,
                header,
                index: Arc::new(SegmentIndex::new()),
                degraded: AtomicBool::new(false),
            },
            append: Mutex::new(append),
            len: AtomicU64::new(SegmentHeader::LEN as u64),
        })
    }

    /// Append one record and index it.
    ///
    /// The length prefix and body go out as one contiguous write, so a
    /// concurrent reader sees either the whole frame or none of it.
    pub fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let mut file = self.append.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        let record = Record::new(key, value, unix_now(), offset);
        let framed = record.encode()?;
        file.write_all(&framed)?;
        self.len.store(offset + framed.len() as u64, Ordering::Release);
        self.core
            .index
            .set(record.key, offset, record.creation_time);
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>, ReadError> {
        self.core.read(key)
    }

    /// Bytes written to this segment, header included. Tracks the file size
    /// without a stat call.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= SegmentHeader::LEN as u64
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn unique_keys(&self) -> Vec<String> {
        self.core.index.all_keys()
    }

    pub fn file_info(&self) -> io::Result<fs::Metadata> {
        self.core.file.metadata()
    }

    /// An immutable view over the same file and index.
    ///
    /// The caller must not write to `self` afterwards; the engine enforces
    /// this by swapping in a new active segment before freezing the old one.
    pub fn freeze(&self) -> io::Result<ImmutableSegment> {
        debug!("freezing segment {} at {} bytes", self.id(), self.len());
        Ok(ImmutableSegment {
            core: self.core.try_clone()?,
        })
    }

    /// Flush the append handle to stable storage and close both handles.
    ///
    /// A frozen view taken via [`Self::freeze`] keeps its own handle and
    /// stays readable.
    pub fn close(self) -> io::Result<()> {
        debug!("closing segment {}", self.id());
        self.append.lock().sync_all()
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> &Arc<SegmentIndex> {
        &self.core.index
    }
}

fn segment_id(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "segment path has no file name"))
}
