//! File writer
//!
//! Series are written one at a time, points in ascending time order. Points
//! are buffered until a chunk is full, so a writer can be fed directly from a
//! merge stream without materialising a whole series.

use super::chunk::{put_str, Chunk};
use super::{ChunkMetadata, TsFileConfig, FORMAT_VERSION, MAGIC};
use crate::{DataType, Result, SeriesKey, StrataError, TimeRange, TimeValuePair};
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Summary of a finished file
#[derive(Debug, Clone)]
pub struct TsFileSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub device_ranges: BTreeMap<String, TimeRange>,
    pub series_count: usize,
    pub point_count: usize,
}

struct SeriesState {
    series: SeriesKey,
    data_type: DataType,
    pending: Vec<TimeValuePair>,
    last_time: Option<i64>,
}

/// Writer for one data file
pub struct TsFileWriter {
    path: PathBuf,
    config: TsFileConfig,
    file: BufWriter<File>,
    position: u64,
    index: Vec<ChunkMetadata>,
    device_ranges: BTreeMap<String, TimeRange>,
    current: Option<SeriesState>,
    series_count: usize,
    point_count: usize,
}

impl TsFileWriter {
    /// Create a new file and write its header
    pub fn create(path: impl AsRef<Path>, config: TsFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = Self {
            path,
            config,
            file: BufWriter::new(file),
            position: 0,
            index: Vec::new(),
            device_ranges: BTreeMap::new(),
            current: None,
            series_count: 0,
            point_count: 0,
        };
        writer.write_header()?;
        Ok(writer)
    }

    /// Path being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Begin a new series; the previous one is finished implicitly
    pub fn start_series(&mut self, series: &SeriesKey, data_type: DataType) -> Result<()> {
        self.end_series()?;
        self.current = Some(SeriesState {
            series: series.clone(),
            data_type,
            pending: Vec::with_capacity(self.config.max_points_per_chunk.min(4096)),
            last_time: None,
        });
        Ok(())
    }

    /// Append one point of the current series
    pub fn write_point(&mut self, point: TimeValuePair) -> Result<()> {
        let max_points = self.config.max_points_per_chunk.max(1);
        let state = self
            .current
            .as_mut()
            .ok_or_else(|| StrataError::Internal("write_point without start_series".into()))?;

        if state.last_time.map_or(false, |last| point.timestamp <= last) {
            return Err(StrataError::Internal(format!(
                "Out of order point {} for {}",
                point.timestamp, state.series
            )));
        }
        if point.value.data_type() != state.data_type {
            return Err(StrataError::TypeMismatch {
                series: state.series.canonical(),
                expected: state.data_type.to_string(),
                actual: point.value.data_type().to_string(),
            });
        }

        state.last_time = Some(point.timestamp);
        state.pending.push(point);
        if state.pending.len() >= max_points {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Finish the current series, writing any buffered points
    pub fn end_series(&mut self) -> Result<()> {
        self.flush_chunk()?;
        if let Some(state) = self.current.take() {
            if state.last_time.is_some() {
                self.series_count += 1;
            }
        }
        Ok(())
    }

    /// Write a whole sorted series
    pub fn write_series(
        &mut self,
        series: &SeriesKey,
        data_type: DataType,
        points: impl IntoIterator<Item = TimeValuePair>,
    ) -> Result<()> {
        self.start_series(series, data_type)?;
        for point in points {
            self.write_point(point)?;
        }
        self.end_series()
    }

    fn flush_chunk(&mut self) -> Result<()> {
        let compression = self.config.compression();
        let Some(state) = self.current.as_mut() else {
            return Ok(());
        };
        if state.pending.is_empty() {
            return Ok(());
        }

        let points = std::mem::take(&mut state.pending);
        let chunk = Chunk::encode(&state.series, state.data_type, &points, compression)?;
        let bytes = chunk.to_bytes();

        let time_range = TimeRange::new(points[0].timestamp, points[points.len() - 1].timestamp);
        self.index.push(ChunkMetadata {
            series: state.series.clone(),
            data_type: state.data_type,
            offset: self.position,
            size: bytes.len() as u32,
            point_count: points.len() as u32,
            time_range,
        });
        self.device_ranges
            .entry(state.series.device.clone())
            .and_modify(|r| *r = r.merge(&time_range))
            .or_insert(time_range);

        self.file.write_all(&bytes)?;
        self.position += bytes.len() as u64;
        self.point_count += points.len();
        Ok(())
    }

    /// Write index and footer, sync, and return the file summary
    pub fn finish(mut self) -> Result<TsFileSummary> {
        self.end_series()?;

        let index_offset = self.position;
        let index = self.encode_index();
        self.file.write_all(&index)?;
        self.position += index.len() as u64;

        let mut footer = BytesMut::with_capacity(super::FOOTER_SIZE);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_slice(MAGIC);
        self.file.write_all(&footer)?;
        self.position += footer.len() as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(TsFileSummary {
            path: self.path,
            file_size: self.position,
            device_ranges: self.device_ranges,
            series_count: self.series_count,
            point_count: self.point_count,
        })
    }

    /// Drop the partially written file
    pub fn abort(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(super::HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        self.file.write_all(&buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn encode_index(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.index.len() as u32);

        for meta in &self.index {
            put_str(&mut buf, &meta.series.device);
            put_str(&mut buf, &meta.series.measurement);
            buf.put_u8(meta.data_type as u8);
            buf.put_u64_le(meta.offset);
            buf.put_u32_le(meta.size);
            buf.put_u32_le(meta.point_count);
            buf.put_i64_le(meta.time_range.start);
            buf.put_i64_le(meta.time_range.end);
        }
        buf
    }
}
