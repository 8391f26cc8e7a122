//! File reader
//!
//! The reader keeps one open handle for the lifetime of the value. Sharing it
//! through an `Arc` lets any number of queries and compaction tasks read the
//! same file; the handle closes when the last holder drops it.

use super::chunk::{get_str, Chunk};
use super::{ChunkMetadata, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::{DataType, Result, SeriesKey, StrataError, TimeRange, TimeValuePair};
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Reader over one finished data file
pub struct TsFileReader {
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    index: BTreeMap<SeriesKey, Vec<ChunkMetadata>>,
}

impl TsFileReader {
    /// Open a data file, validating header, footer and index
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(StrataError::InvalidFormat(format!(
                "{} is too short to be a complete file ({} bytes)",
                path.display(),
                file_size
            )));
        }

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        let mut cursor = &footer[..];
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        let index_crc = cursor.get_u32_le();
        if cursor != &MAGIC[..] {
            return Err(StrataError::InvalidFormat(format!(
                "Invalid footer magic in {}",
                path.display()
            )));
        }

        // Read header
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[..4] != &MAGIC[..] {
            return Err(StrataError::InvalidFormat(format!(
                "Invalid header magic in {}",
                path.display()
            )));
        }
        let version = (&header[4..]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let index_end = index_offset
            .checked_add(index_size)
            .and_then(|end| end.checked_add(FOOTER_SIZE as u64));
        if index_offset < HEADER_SIZE as u64 || index_end != Some(file_size) {
            return Err(StrataError::Corruption(format!(
                "Index bounds of {} do not match file size",
                path.display()
            )));
        }

        // Read index
        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_data = vec![0u8; index_size as usize];
        file.read_exact(&mut index_data)?;
        let actual = crc32fast::hash(&index_data);
        if actual != index_crc {
            return Err(StrataError::ChecksumMismatch {
                expected: index_crc,
                actual,
            });
        }
        let index = Self::parse_index(&index_data)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size,
            index,
        })
    }

    fn parse_index(data: &[u8]) -> Result<BTreeMap<SeriesKey, Vec<ChunkMetadata>>> {
        let mut cursor = data;
        if cursor.remaining() < 4 {
            return Err(StrataError::InvalidFormat("Index too short".into()));
        }
        let count = cursor.get_u32_le() as usize;

        let mut index: BTreeMap<SeriesKey, Vec<ChunkMetadata>> = BTreeMap::new();
        for _ in 0..count {
            let device = get_str(&mut cursor)?;
            let measurement = get_str(&mut cursor)?;
            if cursor.remaining() < 33 {
                return Err(StrataError::InvalidFormat("Index entry truncated".into()));
            }
            let series = SeriesKey::new(device, measurement);
            let meta = ChunkMetadata {
                series: series.clone(),
                data_type: DataType::try_from(cursor.get_u8())?,
                offset: cursor.get_u64_le(),
                size: cursor.get_u32_le(),
                point_count: cursor.get_u32_le(),
                time_range: TimeRange::new(cursor.get_i64_le(), cursor.get_i64_le()),
            };
            index.entry(series).or_default().push(meta);
        }
        Ok(index)
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// All series stored in the file, sorted
    pub fn series(&self) -> Vec<SeriesKey> {
        self.index.keys().cloned().collect()
    }

    /// Check if the file holds a series
    pub fn contains_series(&self, series: &SeriesKey) -> bool {
        self.index.contains_key(series)
    }

    /// Chunk metadata of a series in file order
    pub fn chunk_metadata(&self, series: &SeriesKey) -> &[ChunkMetadata] {
        self.index.get(series).map_or(&[], Vec::as_slice)
    }

    /// Data type recorded for a series
    pub fn data_type(&self, series: &SeriesKey) -> Option<DataType> {
        self.chunk_metadata(series).first().map(|m| m.data_type)
    }

    /// Read and verify one chunk
    pub fn read_chunk(&self, meta: &ChunkMetadata) -> Result<Chunk> {
        let data_end = self.file_size - FOOTER_SIZE as u64;
        let chunk_end = meta.offset.checked_add(meta.size as u64);
        if meta.offset < HEADER_SIZE as u64 || chunk_end.map_or(true, |end| end > data_end) {
            return Err(StrataError::Corruption(format!(
                "Chunk of {} at offset {} (+{}) lies outside {}",
                meta.series,
                meta.offset,
                meta.size,
                self.path.display()
            )));
        }
        let mut buf = vec![0u8; meta.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(meta.offset))?;
            file.read_exact(&mut buf)?;
        }
        let chunk = Chunk::from_bytes(&buf)?;
        if chunk.header.series != meta.series {
            return Err(StrataError::Corruption(format!(
                "Chunk at offset {} of {} belongs to {}, index says {}",
                meta.offset,
                self.path.display(),
                chunk.header.series,
                meta.series
            )));
        }
        Ok(chunk)
    }

    /// Decode every point of a series
    pub fn read_series(&self, series: &SeriesKey) -> Result<Vec<TimeValuePair>> {
        let mut points = Vec::new();
        for meta in self.chunk_metadata(series) {
            points.extend(self.read_chunk(meta)?.decode_points()?);
        }
        Ok(points)
    }

    /// Per-device time ranges computed from the index
    pub fn device_time_ranges(&self) -> BTreeMap<String, TimeRange> {
        let mut ranges: BTreeMap<String, TimeRange> = BTreeMap::new();
        for meta in self.index.values().flatten() {
            ranges
                .entry(meta.series.device.clone())
                .and_modify(|r| *r = r.merge(&meta.time_range))
                .or_insert(meta.time_range);
        }
        ranges
    }
}

impl std::fmt::Debug for TsFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsFileReader")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("series", &self.index.len())
            .finish()
    }
}
