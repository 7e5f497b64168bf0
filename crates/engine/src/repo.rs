//! Data-directory layout.
//!
//! All segments of one engine live in a single directory. Fresh segments
//! are named `<nanoseconds>-<uuid>.data`; the nanosecond prefix makes
//! lexicographic order equal creation order within a process, and the uuid
//! suffix disambiguates bursty rollovers. Compaction renames by appending
//! `.compact`, which keeps the segment's sort position.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub(crate) const SEGMENT_FILE_EXT: &str = ".data";
pub(crate) const COMPACT_FILE_EXT: &str = ".compact";

/// Generate a fresh segment file name.
pub(crate) fn generate_segment_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    format!("{}-{}{}", nanos, Uuid::new_v4(), SEGMENT_FILE_EXT)
}

/// File name of the compacted rewrite of segment `id`.
pub(crate) fn compact_name(id: &str) -> String {
    format!("{id}{COMPACT_FILE_EXT}")
}

/// `true` if `name` names a segment produced by compaction.
pub(crate) fn is_compacted_name(name: &str) -> bool {
    name.ends_with(COMPACT_FILE_EXT)
}

/// The source segment name of a compacted rewrite, if `name` is one.
pub(crate) fn compact_source(name: &str) -> Option<&str> {
    name.strip_suffix(COMPACT_FILE_EXT)
}

/// `true` if `name` follows the segment file name grammar.
fn is_segment_name(name: &str) -> bool {
    name.ends_with(SEGMENT_FILE_EXT) || name.ends_with(&format!("{SEGMENT_FILE_EXT}{COMPACT_FILE_EXT}"))
}

/// Scan `dir` for segment files, sorted ascending by name (creation order).
pub(crate) fn existing_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if is_segment_name(&name.to_string_lossy()) {
            segments.push(entry.path());
        }
    }

    segments.sort();

    Ok(segments)
}
