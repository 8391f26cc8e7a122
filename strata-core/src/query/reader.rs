//! Per-source point readers

use super::PointReader;
use crate::memtable::TvList;
use crate::resource::TsFileResource;
use crate::tsfile::{ChunkMetadata, TsFileReader};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeValuePair, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

fn is_deleted(deletions: &[TimeRange], timestamp: Timestamp) -> bool {
    deletions.iter().any(|r| r.contains(timestamp))
}

/// Reader over a pinned, sorted memtable snapshot
pub struct MemChunkReader {
    list: Option<Arc<TvList>>,
    position: usize,
    range: TimeRange,
    deletions: Vec<TimeRange>,
}

impl MemChunkReader {
    pub fn new(list: Arc<TvList>, range: TimeRange, deletions: Vec<TimeRange>) -> Self {
        // sorted lists allow skipping straight to the first point in range
        let position = if list.is_sorted() {
            let mut low = 0;
            let mut high = list.len();
            while low < high {
                let mid = (low + high) / 2;
                if list.time(mid) < range.start {
                    low = mid + 1;
                } else {
                    high = mid;
                }
            }
            low
        } else {
            0
        };

        Self {
            list: Some(list),
            position,
            range,
            deletions,
        }
    }

    fn skip_invisible(&mut self) {
        let Some(list) = self.list.as_ref() else {
            return;
        };
        while self.position < list.len() {
            let t = list.time(self.position);
            if t > self.range.end {
                self.position = list.len();
                break;
            }
            if t >= self.range.start && !is_deleted(&self.deletions, t) {
                break;
            }
            self.position += 1;
        }
    }
}

impl PointReader for MemChunkReader {
    fn has_next(&mut self) -> Result<bool> {
        self.skip_invisible();
        Ok(self
            .list
            .as_ref()
            .map_or(false, |list| self.position < list.len()))
    }

    fn next(&mut self) -> Result<Option<TimeValuePair>> {
        if !self.has_next()? {
            return Ok(None);
        }
        let Some(list) = self.list.as_ref() else {
            return Ok(None);
        };
        let point = TimeValuePair {
            timestamp: list.time(self.position),
            value: list.value(self.position).clone(),
        };
        self.position += 1;
        Ok(Some(point))
    }

    fn close(&mut self) {
        self.list = None;
    }
}

/// Reader over one series of one closed file, decoding a chunk at a time
pub struct FileSeriesReader {
    resource: Option<Arc<TsFileResource>>,
    reader: Option<Arc<TsFileReader>>,
    series: SeriesKey,
    range: TimeRange,
    deletions: Vec<TimeRange>,
    chunks: VecDeque<ChunkMetadata>,
    buffer: VecDeque<TimeValuePair>,
    opened: bool,
}

impl FileSeriesReader {
    /// Create a reader; deletions recorded against the file are captured now
    pub fn new(resource: Arc<TsFileResource>, series: &SeriesKey, range: TimeRange) -> Self {
        let deletions = resource.deletions_for(series);
        Self {
            resource: Some(resource),
            reader: None,
            series: series.clone(),
            range,
            deletions,
            chunks: VecDeque::new(),
            buffer: VecDeque::new(),
            opened: false,
        }
    }

    pub fn resource(&self) -> Option<&Arc<TsFileResource>> {
        self.resource.as_ref()
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        let Some(resource) = self.resource.as_ref() else {
            return Ok(());
        };
        if !resource.overlaps(&self.series.device, &self.range) {
            return Ok(());
        }

        let reader = resource.reader()?;
        self.chunks = reader
            .chunk_metadata(&self.series)
            .iter()
            .filter(|meta| meta.time_range.overlaps(&self.range))
            .filter(|meta| {
                // a chunk wholly covered by one deletion is never decoded
                !self.deletions.iter().any(|d| {
                    d.start <= meta.time_range.start && d.end >= meta.time_range.end
                })
            })
            .cloned()
            .collect();
        self.reader = Some(reader);
        Ok(())
    }

    fn fill_buffer(&mut self) -> Result<()> {
        while self.buffer.is_empty() {
            let Some(meta) = self.chunks.pop_front() else {
                return Ok(());
            };
            let Some(reader) = self.reader.as_ref() else {
                return Ok(());
            };
            let points = reader.read_chunk(&meta)?.decode_points()?;
            let range = self.range;
            let deletions = &self.deletions;
            self.buffer.extend(
                points
                    .into_iter()
                    .filter(|p| range.contains(p.timestamp) && !is_deleted(deletions, p.timestamp)),
            );
        }
        Ok(())
    }

    fn context(&self, e: StrataError) -> StrataError {
        e.on_series(&self.series, self.range)
    }
}

impl PointReader for FileSeriesReader {
    fn has_next(&mut self) -> Result<bool> {
        if !self.opened {
            self.open().map_err(|e| self.context(e))?;
        }
        self.fill_buffer().map_err(|e| self.context(e))?;
        Ok(!self.buffer.is_empty())
    }

    fn next(&mut self) -> Result<Option<TimeValuePair>> {
        if !self.has_next()? {
            return Ok(None);
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) {
        self.chunks.clear();
        self.buffer.clear();
        self.reader = None;
        self.resource = None;
        self.opened = true;
    }
}

/// Concatenation of readers over time-disjoint, time-ordered sequence files
pub struct SeqResourceReader {
    readers: VecDeque<FileSeriesReader>,
}

impl SeqResourceReader {
    pub fn new(resources: Vec<Arc<TsFileResource>>, series: &SeriesKey, range: TimeRange) -> Self {
        let readers = resources
            .into_iter()
            .filter(|r| r.overlaps(&series.device, &range))
            .map(|r| FileSeriesReader::new(r, series, range))
            .collect();
        Self { readers }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

impl PointReader for SeqResourceReader {
    fn has_next(&mut self) -> Result<bool> {
        while let Some(front) = self.readers.front_mut() {
            if front.has_next()? {
                return Ok(true);
            }
            if let Some(mut exhausted) = self.readers.pop_front() {
                exhausted.close();
            }
        }
        Ok(false)
    }

    fn next(&mut self) -> Result<Option<TimeValuePair>> {
        if !self.has_next()? {
            return Ok(None);
        }
        match self.readers.front_mut() {
            Some(reader) => reader.next(),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        for reader in self.readers.iter_mut() {
            reader.close();
        }
        self.readers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsfile::{TsFileConfig, TsFileName, TsFileWriter};
    use crate::resource::Deletion;
    use crate::{DataType, Lane, TsValue};
    use std::path::Path;
    use tempfile::tempdir;

    fn closed_file(dir: &Path, version: u64, times: std::ops::Range<i64>) -> Arc<TsFileResource> {
        let path = dir.join(TsFileName::new(version, 0).file_name());
        let config = TsFileConfig {
            max_points_per_chunk: 4,
            compression: false,
        };
        let mut writer = TsFileWriter::create(&path, config).unwrap();
        writer
            .write_series(
                &SeriesKey::new("root.sg.d1", "s1"),
                DataType::Int64,
                times.map(|t| TimeValuePair::new(t, t * 10)),
            )
            .unwrap();
        let summary = writer.finish().unwrap();
        Arc::new(
            TsFileResource::new_closed(&path, Lane::Sequence, summary.device_ranges, summary.file_size)
                .unwrap(),
        )
    }

    fn drain(reader: &mut dyn PointReader) -> Vec<Timestamp> {
        let mut out = Vec::new();
        while let Some(p) = reader.next().unwrap() {
            out.push(p.timestamp);
        }
        out
    }

    #[test]
    fn test_mem_chunk_reader_range_and_deletions() {
        let mut list = TvList::new();
        for t in 0..20 {
            list.put(t, TsValue::Int64(t));
        }
        let mut reader = MemChunkReader::new(
            Arc::new(list),
            TimeRange::new(5, 14),
            vec![TimeRange::new(8, 10)],
        );

        assert_eq!(drain(&mut reader), vec![5, 6, 7, 11, 12, 13, 14]);
        reader.close();
        reader.close();
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn test_file_reader_applies_mods() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let resource = closed_file(dir.path(), 1, 0..20);
        resource
            .append_deletion(Deletion::new(key.clone(), TimeRange::new(4, 11)))
            .unwrap();

        let mut reader = FileSeriesReader::new(Arc::clone(&resource), &key, TimeRange::new(2, 15));
        assert_eq!(drain(&mut reader), vec![2, 3, 12, 13, 14, 15]);

        let mut other = FileSeriesReader::new(resource, &SeriesKey::new("root.sg.d1", "s9"), TimeRange::all());
        assert!(!other.has_next().unwrap());
    }

    #[test]
    fn test_seq_reader_concatenates() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let files = vec![
            closed_file(dir.path(), 1, 0..5),
            closed_file(dir.path(), 2, 5..10),
            closed_file(dir.path(), 3, 10..15),
        ];

        let mut reader = SeqResourceReader::new(files, &key, TimeRange::new(3, 11));
        assert_eq!(reader.len(), 3);
        assert_eq!(drain(&mut reader), vec![3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }
}
