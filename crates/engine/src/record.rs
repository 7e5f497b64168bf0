use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::error::CorruptRecord;

/// Number of bytes in the little-endian length prefix framing every record.
pub const PREFIX_LEN: usize = 8;

/// One write, as stored in a segment file.
///
/// On disk a record is an 8-byte little-endian length followed by a
/// MessagePack body with named fields, so the body is self-describing and
/// can be inspected with stock msgpack tooling.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key under which the value was stored. Never empty in a well-formed
    /// segment.
    pub key: String,
    /// Opaque payload bytes. The engine attaches no meaning to them beyond
    /// the tombstone comparison.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    /// Seconds since the Unix epoch at which the record was created.
    pub creation_time: i64,
    /// Byte offset of this record's length prefix within its segment file,
    /// lowercase hexadecimal. Derivable from the file position; stored for
    /// inspection of raw segment files.
    pub offset: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, creation_time: i64, offset: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            creation_time,
            offset: format!("{offset:x}"),
        }
    }

    /// Serialize with framing, returning one contiguous buffer of
    /// length prefix + body. Callers issue it as a single write so no
    /// torn frame is ever visible to a concurrent reader.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut framed = Vec::with_capacity(PREFIX_LEN + body.len());
        framed.extend_from_slice(&(body.len() as u64).to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decode a record body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(body)
    }

    /// Decode and validate a record body read from `segment` at `offset`.
    ///
    /// A record is corrupt when decoding fails, when the decoded key is
    /// empty, or when `expected_key` is given and does not match.
    pub(crate) fn decode_validated(
        segment: &str,
        offset: u64,
        body: &[u8],
        expected_key: Option<&str>,
    ) -> Result<Self, CorruptRecord> {
        let record = Self::decode(body).map_err(|source| CorruptRecord::Decode {
            segment: segment.into(),
            offset,
            source,
        })?;
        if record.key.is_empty() {
            return Err(CorruptRecord::EmptyKey {
                segment: segment.into(),
                offset,
            });
        }
        if let Some(expected) = expected_key {
            if record.key != expected {
                return Err(CorruptRecord::KeyMismatch {
                    segment: segment.into(),
                    offset,
                    expected: expected.into(),
                    actual: record.key,
                });
            }
        }
        Ok(record)
    }
}

/// Read one framed record body from `reader`.
///
/// Returns `Ok(None)` on end-of-file at a record boundary. A short read
/// mid-record signals a truncated tail and yields
/// [`io::ErrorKind::UnexpectedEof`].
pub fn read_framed<R: Read>(mut reader: R) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; PREFIX_LEN];
    let n = read_up_to(&mut reader, &mut prefix)?;
    if n == 0 {
        return Ok(None);
    }
    if n < PREFIX_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated record length prefix",
        ));
    }
    let len = u64::from_le_bytes(prefix);
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Fill `buf` from `reader`, stopping early only at end-of-file.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}
