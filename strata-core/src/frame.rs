//! Length-prefixed, checksummed records
//!
//! Shared by the write-ahead log, modification files, merge logs and
//! resource sidecars:
//!
//! ```text
//! +-----------+-------------------+---------+
//! | len (u32) | bincode payload   | crc32   |
//! +-----------+-------------------+---------+
//! ```
//!
//! A record that is cut short or fails its checksum ends the readable
//! prefix of a file; everything before it is trusted.

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Serialize a value into one framed record
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload = bincode::serialize(value)?;
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));
    Ok(buf.freeze())
}

/// Decode the record at the start of `data`.
///
/// Returns `Ok(None)` when the record is incomplete.
pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<Option<(T, usize)>> {
    if data.len() < 4 {
        return Ok(None);
    }
    let len = (&data[..4]).get_u32_le() as usize;
    if data.len() < len + 8 {
        return Ok(None);
    }

    let payload = &data[4..4 + len];
    let expected = (&data[4 + len..8 + len]).get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(StrataError::ChecksumMismatch { expected, actual });
    }

    let value = bincode::deserialize(payload)?;
    Ok(Some((value, len + 8)))
}

/// Records of a file plus the length of its valid prefix
pub(crate) struct RecordScan<T> {
    pub records: Vec<T>,
    pub valid_len: u64,
    pub torn: bool,
}

/// Read every intact record of a file; a missing file reads as empty
pub(crate) fn read_all<T: DeserializeOwned>(path: &Path) -> Result<RecordScan<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut offset = 0;
    let mut torn = false;
    while offset < data.len() {
        match decode(&data[offset..]) {
            Ok(Some((record, consumed))) => {
                records.push(record);
                offset += consumed;
            }
            Ok(None)
            | Err(StrataError::ChecksumMismatch { .. })
            | Err(StrataError::Serialization(_)) => {
                torn = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(RecordScan {
        records,
        valid_len: offset as u64,
        torn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..3u64 {
            file.write_all(&encode(&i).unwrap()).unwrap();
        }
        let partial = encode(&99u64).unwrap();
        file.write_all(&partial[..partial.len() - 3]).unwrap();
        drop(file);

        let scan: RecordScan<u64> = read_all(&path).unwrap();
        assert_eq!(scan.records, vec![0, 1, 2]);
        assert!(scan.torn);
        assert_eq!(scan.valid_len, 3 * 16);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let scan: RecordScan<u64> = read_all(&dir.path().join("absent")).unwrap();
        assert!(scan.records.is_empty());
        assert!(!scan.torn);
    }
}
