//! Query data source assembly
//!
//! A read of one series pins the files and memtable snapshots that exist when
//! it opens, wraps each in a point reader, and merges them with a
//! [`PriorityMergeReader`]:
//!
//! - closed sequence files are time-disjoint and concatenated
//! - closed unsequence files are each read on their own
//! - open and flushing memtables are read through copy-on-write snapshots
//!
//! Later writes, deletions and compaction swaps do not affect an open reader.

mod filter;
mod merge_reader;
mod reader;

pub use filter::{Filter, ValueFilter};
pub use merge_reader::{Priority, PriorityMergeReader, SourceTier};
pub use reader::{FileSeriesReader, MemChunkReader, SeqResourceReader};

use crate::memtable::TvList;
use crate::resource::{TsFileResource, TsFileResourceList};
use crate::{Result, SeriesKey, TimeRange, TimeValuePair};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Lazy, forward-only stream of points
pub trait PointReader: Send {
    fn has_next(&mut self) -> Result<bool>;

    /// Next point, `None` once exhausted
    fn next(&mut self) -> Result<Option<TimeValuePair>>;

    /// Release resources; safe to call repeatedly
    fn close(&mut self);
}

/// Identity of one read
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
        }
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A memtable snapshot of an open or flushing file
#[derive(Clone)]
pub struct MemorySource {
    pub resource: Arc<TsFileResource>,
    pub list: Arc<TvList>,
}

/// Sources of one series pinned at query open
#[derive(Clone, Default)]
pub struct QueryDataSource {
    pub series: Option<SeriesKey>,
    pub range: Option<TimeRange>,
    pub seq_files: Vec<Arc<TsFileResource>>,
    pub unseq_files: Vec<Arc<TsFileResource>>,
    pub seq_memory: Vec<MemorySource>,
    pub unseq_memory: Vec<MemorySource>,
}

impl QueryDataSource {
    /// Snapshot the sources of `series` within `range`.
    ///
    /// Both lists are read-locked (sequence first) only while the snapshot is
    /// taken.
    pub fn capture(
        series: &SeriesKey,
        range: TimeRange,
        seq: &TsFileResourceList,
        unseq: &TsFileResourceList,
    ) -> Self {
        let mut source = Self {
            series: Some(series.clone()),
            range: Some(range),
            ..Default::default()
        };

        let seq_guard = seq.read();
        let unseq_guard = unseq.read();
        for resource in seq_guard.iter() {
            Self::pin(series, &range, resource, &mut source.seq_files, &mut source.seq_memory);
        }
        for resource in unseq_guard.iter() {
            Self::pin(
                series,
                &range,
                resource,
                &mut source.unseq_files,
                &mut source.unseq_memory,
            );
        }
        source
    }

    fn pin(
        series: &SeriesKey,
        range: &TimeRange,
        resource: &Arc<TsFileResource>,
        files: &mut Vec<Arc<TsFileResource>>,
        memory: &mut Vec<MemorySource>,
    ) {
        match resource.memtable() {
            Some(memtable) => {
                if let Some(chunk) = memtable.chunk(series) {
                    let list = chunk.sorted_list_for_query();
                    if list.may_overlap(range) {
                        memory.push(MemorySource {
                            resource: Arc::clone(resource),
                            list,
                        });
                    }
                }
            }
            None => {
                if resource.overlaps(&series.device, range) {
                    files.push(Arc::clone(resource));
                }
            }
        }
    }

    /// Total number of pinned sources
    pub fn source_count(&self) -> usize {
        self.seq_files.len() + self.unseq_files.len() + self.seq_memory.len() + self.unseq_memory.len()
    }

    /// Build the merged reader for the captured series
    pub fn into_reader(self, filter: Filter, context: &QueryContext) -> Result<PriorityMergeReader> {
        let Some(series) = self.series.clone() else {
            return Ok(PriorityMergeReader::new());
        };
        let range = match (self.range, filter.time) {
            (Some(a), Some(b)) => a.intersect(&b).unwrap_or(TimeRange::new(1, 0)),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => TimeRange::all(),
        };
        trace!(
            "Query {} on {} over {}: {} sources",
            context.id,
            series,
            range,
            self.source_count()
        );

        let mut reader = PriorityMergeReader::new().with_filter(filter);
        if range.start > range.end {
            return Ok(reader);
        }

        if !self.seq_files.is_empty() {
            reader.add_reader(
                Box::new(SeqResourceReader::new(self.seq_files, &series, range)),
                Priority::new(SourceTier::SeqFile, 0),
            )?;
        }
        for resource in self.unseq_files {
            let version = resource.version();
            reader.add_reader(
                Box::new(FileSeriesReader::new(resource, &series, range)),
                Priority::new(SourceTier::UnseqFile, version),
            )?;
        }
        let memory = self
            .seq_memory
            .into_iter()
            .map(|m| (SourceTier::SeqMemory, m))
            .chain(self.unseq_memory.into_iter().map(|m| (SourceTier::UnseqMemory, m)));
        for (tier, memory) in memory {
            let deletions = memory.resource.deletions_for(&series);
            reader.add_reader(
                Box::new(MemChunkReader::new(memory.list, range, deletions)),
                Priority::new(tier, memory.resource.version()),
            )?;
        }
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::tsfile::{TsFileConfig, TsFileName, TsFileWriter};
    use crate::{DataType, Lane, TsValue};
    use tempfile::tempdir;

    fn closed(
        dir: &std::path::Path,
        lane: Lane,
        version: u64,
        points: &[(i64, i64)],
    ) -> Arc<TsFileResource> {
        let path = dir.join(lane.dir_name()).join(TsFileName::new(version, 0).file_name());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut writer = TsFileWriter::create(&path, TsFileConfig::default()).unwrap();
        writer
            .write_series(
                &SeriesKey::new("root.sg.d1", "s1"),
                DataType::Int64,
                points.iter().map(|&(t, v)| TimeValuePair::new(t, v)),
            )
            .unwrap();
        let summary = writer.finish().unwrap();
        Arc::new(TsFileResource::new_closed(&path, lane, summary.device_ranges, summary.file_size).unwrap())
    }

    #[test]
    fn test_snapshot_ignores_later_writes() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let seq = TsFileResourceList::new(Lane::Sequence);
        let unseq = TsFileResourceList::new(Lane::Unsequence);

        seq.insert(closed(dir.path(), Lane::Sequence, 1, &[(1, 1), (5, 1), (9, 1)]));
        unseq.insert(closed(dir.path(), Lane::Unsequence, 2, &[(5, 2)]));

        let memtable = Arc::new(MemTable::new(3));
        memtable.insert(&key, 9, TsValue::Int64(3)).unwrap();
        let working = Arc::new(
            TsFileResource::open_new(
                dir.path().join("sequence").join(TsFileName::new(3, 0).file_name()),
                Lane::Sequence,
                Arc::clone(&memtable),
            )
            .unwrap(),
        );
        seq.insert(working);

        let source = QueryDataSource::capture(&key, TimeRange::all(), &seq, &unseq);
        assert_eq!(source.source_count(), 3);

        memtable.insert(&key, 10, TsValue::Int64(4)).unwrap();
        memtable.insert(&key, 1, TsValue::Int64(4)).unwrap();

        let mut reader = source
            .into_reader(Filter::default(), &QueryContext::new())
            .unwrap();
        let points = reader.read_all().unwrap();
        assert_eq!(
            points,
            vec![
                TimeValuePair::new(1, 1i64),
                TimeValuePair::new(5, 2i64),
                TimeValuePair::new(9, 3i64),
            ]
        );
    }

    #[test]
    fn test_time_filter_narrows_sources() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let seq = TsFileResourceList::new(Lane::Sequence);
        let unseq = TsFileResourceList::new(Lane::Unsequence);
        seq.insert(closed(dir.path(), Lane::Sequence, 1, &[(1, 1), (2, 1)]));
        seq.insert(closed(dir.path(), Lane::Sequence, 2, &[(100, 1), (200, 1)]));

        let source = QueryDataSource::capture(&key, TimeRange::new(150, 300), &seq, &unseq);
        assert_eq!(source.seq_files.len(), 1);

        let mut reader = source
            .into_reader(Filter::time_range(0, 199), &QueryContext::new())
            .unwrap();
        assert!(!reader.has_next().unwrap());
    }
}
