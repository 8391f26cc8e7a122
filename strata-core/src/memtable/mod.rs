//! In-memory write buffer
//!
//! A `MemTable` buffers the writes of one open file: one `WritableMemChunk`
//! per series, indexed by a concurrent skip map so writers to different
//! series never contend.

mod chunk;
mod tvlist;

pub use chunk::WritableMemChunk;
pub use tvlist::TvList;

use crate::{Result, SeriesKey, StrataError, TimeRange, Timestamp, TsValue};
use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// MemTable for in-memory writes
pub struct MemTable {
    /// Unique ID for this memtable
    id: u64,
    chunks: SkipMap<SeriesKey, Arc<WritableMemChunk>>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Set once the memtable is handed to the flusher
    frozen: AtomicBool,
    /// Creation time for age-based flushing
    created_at: Instant,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            id,
            chunks: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a point; the series keeps the data type of its first write
    pub fn insert(&self, series: &SeriesKey, timestamp: Timestamp, value: TsValue) -> Result<()> {
        let entry = self
            .chunks
            .get_or_insert_with(series.clone(), || {
                Arc::new(WritableMemChunk::new(value.data_type()))
            });
        let chunk = entry.value();

        if chunk.data_type() != value.data_type() {
            return Err(StrataError::TypeMismatch {
                series: series.canonical(),
                expected: chunk.data_type().to_string(),
                actual: value.data_type().to_string(),
            });
        }

        let cost = chunk.put(timestamp, value);
        self.size_bytes
            .fetch_add(cost + series.size(), Ordering::Relaxed);
        Ok(())
    }

    /// Delete points of one series inside `range`
    pub fn delete(&self, series: &SeriesKey, range: &TimeRange) -> usize {
        self.chunks
            .get(series)
            .map_or(0, |entry| entry.value().delete(range))
    }

    /// Get the chunk of a series
    pub fn chunk(&self, series: &SeriesKey) -> Option<Arc<WritableMemChunk>> {
        self.chunks.get(series).map(|entry| Arc::clone(entry.value()))
    }

    /// Get all series keys in sorted order
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.chunks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Check if MemTable holds data for a series
    pub fn contains_series(&self, series: &SeriesKey) -> bool {
        self.chunks.contains_key(series)
    }

    /// Per-device time ranges of the buffered data
    pub fn device_time_ranges(&self) -> BTreeMap<String, TimeRange> {
        let mut ranges: BTreeMap<String, TimeRange> = BTreeMap::new();
        for entry in self.chunks.iter() {
            if let Some(range) = entry.value().time_range() {
                ranges
                    .entry(entry.key().device.clone())
                    .and_modify(|r| *r = r.merge(&range))
                    .or_insert(range);
            }
        }
        ranges
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= size_limit
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Get the age since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Total number of buffered points
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|entry| entry.value().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark as immutable; returns false if it was already frozen
    pub fn freeze(&self) -> bool {
        !self.frozen.swap(true, Ordering::AcqRel)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("series", &self.chunks.len())
            .field("size_bytes", &self.size())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memtable_insert_query() {
        let memtable = MemTable::new(1);

        let key = SeriesKey::new("root.sg.d1", "temperature");
        for i in (0..100).rev() {
            memtable
                .insert(&key, i * 1000, TsValue::Double(20.0 + i as f64))
                .unwrap();
        }

        assert_eq!(memtable.len(), 100);
        let list = memtable.chunk(&key).unwrap().sorted_list_for_query();
        assert_eq!(list.time(0), 0);
        assert_eq!(list.time(99), 99_000);

        let ranges = memtable.device_time_ranges();
        assert_eq!(ranges["root.sg.d1"], TimeRange::new(0, 99_000));
    }

    #[test]
    fn test_memtable_type_mismatch() {
        let memtable = MemTable::new(1);
        let key = SeriesKey::new("root.sg.d1", "s1");

        memtable.insert(&key, 1, TsValue::Int64(1)).unwrap();
        let err = memtable.insert(&key, 2, TsValue::Text("x".into()));
        assert!(matches!(err, Err(StrataError::TypeMismatch { .. })));
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_memtable_delete() {
        let memtable = MemTable::new(1);
        let key = SeriesKey::new("root.sg.d1", "s1");
        for i in 0..20 {
            memtable.insert(&key, i, TsValue::Int32(i as i32)).unwrap();
        }

        assert_eq!(memtable.delete(&key, &TimeRange::new(5, 9)), 5);
        assert_eq!(memtable.delete(&SeriesKey::new("root.sg.d2", "s1"), &TimeRange::all()), 0);
        assert_eq!(memtable.len(), 15);
        assert!(memtable.freeze());
        assert!(!memtable.freeze());
    }
}
