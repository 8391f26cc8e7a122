//! Per-series writable chunk with copy-on-write snapshots

use super::TvList;
use crate::{DataType, TimeRange, Timestamp, TsValue};
use parking_lot::RwLock;
use std::sync::Arc;

/// Buffer of one series inside a memtable.
///
/// Readers receive an `Arc<TvList>`. A later write or delete that would
/// mutate a list still held by a reader clones it first, so a captured
/// snapshot never changes underneath its holder.
#[derive(Debug)]
pub struct WritableMemChunk {
    data_type: DataType,
    list: RwLock<Arc<TvList>>,
}

impl WritableMemChunk {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            list: RwLock::new(Arc::new(TvList::new())),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Append a point, returning its approximate memory cost
    pub fn put(&self, timestamp: Timestamp, value: TsValue) -> usize {
        let mut list = self.list.write();
        Arc::make_mut(&mut *list).put(timestamp, value)
    }

    pub fn count(&self) -> usize {
        self.list.read().len()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.list.read().time_range()
    }

    /// Sorted, duplicate-free view for a query.
    ///
    /// An already sorted list is shared as is. Otherwise it is sorted in place
    /// when nobody else holds it, or sorted into a fresh copy when a reader
    /// still does.
    pub fn sorted_list_for_query(&self) -> Arc<TvList> {
        {
            let list = self.list.read();
            if list.is_sorted() {
                return Arc::clone(&list);
            }
        }

        let mut list = self.list.write();
        if !list.is_sorted() {
            Arc::make_mut(&mut *list).sort_and_dedup();
        }
        Arc::clone(&list)
    }

    /// Sorted view for the flusher; identical semantics to the query path
    pub fn sorted_list_for_flush(&self) -> Arc<TvList> {
        self.sorted_list_for_query()
    }

    /// Remove points in `range`; readers that already hold a snapshot keep theirs
    pub fn delete(&self, range: &TimeRange) -> usize {
        let mut list = self.list.write();
        if !list.may_overlap(range) {
            return 0;
        }
        Arc::make_mut(&mut *list).delete(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_list_reused_when_clean() {
        let chunk = WritableMemChunk::new(DataType::Int64);
        for i in 0..5 {
            chunk.put(i, TsValue::Int64(i));
        }

        let first = chunk.sorted_list_for_query();
        let second = chunk.sorted_list_for_query();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_snapshot_survives_writes_and_deletes() {
        let chunk = WritableMemChunk::new(DataType::Int64);
        chunk.put(2, TsValue::Int64(2));
        chunk.put(1, TsValue::Int64(1));

        let snapshot = chunk.sorted_list_for_query();
        assert_eq!(snapshot.len(), 2);

        chunk.put(0, TsValue::Int64(0));
        chunk.put(1, TsValue::Int64(100));
        assert_eq!(chunk.delete(&TimeRange::new(2, 2)), 1);

        // the captured view is untouched
        assert_eq!(
            snapshot.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(snapshot.value(0), &TsValue::Int64(1));

        let fresh = chunk.sorted_list_for_query();
        assert!(!Arc::ptr_eq(&snapshot, &fresh));
        assert_eq!(
            fresh.to_pairs(),
            vec![
                crate::TimeValuePair::new(0, 0i64),
                crate::TimeValuePair::new(1, 100i64),
            ]
        );
    }

    #[test]
    fn test_delete_outside_range_is_noop() {
        let chunk = WritableMemChunk::new(DataType::Double);
        chunk.put(10, TsValue::Double(1.0));
        let snapshot = chunk.sorted_list_for_query();

        assert_eq!(chunk.delete(&TimeRange::new(20, 30)), 0);
        assert!(Arc::ptr_eq(&snapshot, &chunk.sorted_list_for_query()));
    }
}
