//! Immutable on-disk file format
//!
//! Layout of one file:
//!
//! ```text
//! +--------+---------+-----+---------+-------+--------+
//! | header | chunk 0 | ... | chunk N | index | footer |
//! +--------+---------+-----+---------+-------+--------+
//! ```
//!
//! - header: magic + format version
//! - chunks: see [`Chunk`]
//! - index: one [`ChunkMetadata`] per chunk
//! - footer: index offset, index size, index crc, magic

mod chunk;
mod reader;
mod writer;

pub use chunk::{Chunk, ChunkHeader, Compression, Encoding};
pub use reader::TsFileReader;
pub use writer::{TsFileSummary, TsFileWriter};

use crate::{DataType, SeriesKey, TimeRange};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// File format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes at both ends of a file
pub const MAGIC: &[u8; 4] = b"STSF";

/// Size of the file header
pub const HEADER_SIZE: usize = 8;

/// Size of the file footer
pub const FOOTER_SIZE: usize = 24;

/// Data file extension
pub const TSFILE_EXTENSION: &str = "tsfile";

/// Suffix of compaction targets that have not been swapped in yet
pub const MERGE_SUFFIX: &str = ".merge";

/// Suffix of the resource sidecar
pub const RESOURCE_SUFFIX: &str = ".resource";

/// Suffix of the modification file
pub const MODS_SUFFIX: &str = ".mods";

/// Suffix of the write-ahead log of an open file
pub const WAL_SUFFIX: &str = ".wal";

/// File writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsFileConfig {
    /// Maximum number of points per chunk
    pub max_points_per_chunk: usize,
    /// Compress chunk payloads with LZ4
    pub compression: bool,
}

impl Default for TsFileConfig {
    fn default() -> Self {
        Self {
            max_points_per_chunk: crate::config::DEFAULT_MAX_POINTS_PER_CHUNK,
            compression: true,
        }
    }
}

impl TsFileConfig {
    pub(crate) fn compression(&self) -> Compression {
        if self.compression {
            Compression::Lz4
        } else {
            Compression::Uncompressed
        }
    }
}

/// Location and summary of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub series: SeriesKey,
    pub data_type: DataType,
    /// Byte offset of the chunk in the file
    pub offset: u64,
    /// Serialized chunk size including checksum
    pub size: u32,
    pub point_count: u32,
    pub time_range: TimeRange,
}

/// Version and compaction level encoded in a file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TsFileName {
    pub version: u64,
    pub level: u32,
}

impl TsFileName {
    pub fn new(version: u64, level: u32) -> Self {
        Self { version, level }
    }

    /// `{version:020}-{level}.tsfile`
    pub fn file_name(&self) -> String {
        format!("{:020}-{}.{}", self.version, self.level, TSFILE_EXTENSION)
    }

    /// Parse a data file name, ignoring any suffix after `.tsfile`
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.split(".tsfile").next()?;
        let (version, level) = stem.split_once('-')?;
        Some(Self {
            version: version.parse().ok()?,
            level: level.parse().ok()?,
        })
    }
}

/// Check if a path names a finished data file
pub fn is_tsfile(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == TSFILE_EXTENSION)
}

/// Append a suffix to the full file name (`a.tsfile` -> `a.tsfile.mods`)
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Sidecar path of a data file
pub fn resource_path(path: &Path) -> PathBuf {
    with_suffix(path, RESOURCE_SUFFIX)
}

/// Modification file path of a data file
pub fn mods_path(path: &Path) -> PathBuf {
    with_suffix(path, MODS_SUFFIX)
}

/// Write-ahead log path of a data file
pub fn wal_path(path: &Path) -> PathBuf {
    with_suffix(path, WAL_SUFFIX)
}

/// Temporary path a compaction target is written to
pub fn merge_temp_path(path: &Path) -> PathBuf {
    with_suffix(path, MERGE_SUFFIX)
}
