//! K-way merge of point readers with priority resolution
//!
//! Each source contributes its head point to a heap ordered by timestamp
//! ascending, then priority descending. On a timestamp collision only the
//! highest-priority point survives; the others are consumed and discarded.

use super::{Filter, PointReader};
use crate::{Lane, Result, StrataError, TimeValuePair};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Kind of source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceTier {
    SeqFile,
    SeqMemory,
    UnseqFile,
    UnseqMemory,
}

impl SourceTier {
    pub fn lane(&self) -> Lane {
        match self {
            SourceTier::SeqFile | SourceTier::SeqMemory => Lane::Sequence,
            SourceTier::UnseqFile | SourceTier::UnseqMemory => Lane::Unsequence,
        }
    }
}

/// Recency order of sources.
///
/// Every point in the unsequence lane was written after any sequence point
/// with the same timestamp, and within a lane versions follow creation
/// order. So the lane decides first, then the version; the tier only breaks
/// ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority {
    pub tier: SourceTier,
    pub version: u64,
}

impl Priority {
    pub fn new(tier: SourceTier, version: u64) -> Self {
        Self { tier, version }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier
            .lane()
            .cmp(&other.tier.lane())
            .then(self.version.cmp(&other.version))
            .then(self.tier.cmp(&other.tier))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct HeapElement {
    point: TimeValuePair,
    priority: Priority,
    source: usize,
}

impl PartialEq for HeapElement {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapElement {}

impl PartialOrd for HeapElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapElement {
    // BinaryHeap is a max-heap: smallest timestamp first, then highest priority
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .point
            .timestamp
            .cmp(&self.point.timestamp)
            .then(self.priority.cmp(&other.priority))
            .then(other.source.cmp(&self.source))
    }
}

/// Time-ordered, deduplicated view over several sources of one series
pub struct PriorityMergeReader {
    sources: Vec<Box<dyn PointReader>>,
    priorities: Vec<Priority>,
    heap: BinaryHeap<HeapElement>,
    filter: Filter,
    pending: Option<TimeValuePair>,
    closed: bool,
}

impl PriorityMergeReader {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            priorities: Vec::new(),
            heap: BinaryHeap::new(),
            filter: Filter::default(),
            pending: None,
            closed: false,
        }
    }

    /// Apply `filter` to every resolved point
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Add a source; its first point is read immediately
    pub fn add_reader(&mut self, reader: Box<dyn PointReader>, priority: Priority) -> Result<()> {
        if self.closed {
            return Err(StrataError::Internal("reader is closed".into()));
        }
        let index = self.sources.len();
        self.sources.push(reader);
        self.priorities.push(priority);
        self.advance(index)
    }

    /// Number of sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Drain every remaining point
    pub fn read_all(&mut self) -> Result<Vec<TimeValuePair>> {
        let mut points = Vec::new();
        while let Some(point) = PointReader::next(self)? {
            points.push(point);
        }
        Ok(points)
    }

    fn advance(&mut self, index: usize) -> Result<()> {
        let Some(source) = self.sources.get_mut(index) else {
            return Ok(());
        };
        match source.next()? {
            Some(point) => self.heap.push(HeapElement {
                point,
                priority: self.priorities[index],
                source: index,
            }),
            None => source.close(),
        }
        Ok(())
    }

    fn resolve_next(&mut self) -> Result<Option<TimeValuePair>> {
        while let Some(winner) = self.heap.pop() {
            self.advance(winner.source)?;

            // shadowed points at the same timestamp
            while let Some(top) = self.heap.peek() {
                if top.point.timestamp != winner.point.timestamp {
                    break;
                }
                if let Some(shadowed) = self.heap.pop() {
                    self.advance(shadowed.source)?;
                }
            }

            if self.filter.satisfies_time(winner.point.timestamp)
                && self.filter.satisfies_value(&winner.point.value)
            {
                return Ok(Some(winner.point));
            }
        }
        Ok(None)
    }
}

impl Default for PriorityMergeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PointReader for PriorityMergeReader {
    fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if self.pending.is_none() {
            self.pending = self.resolve_next()?;
        }
        Ok(self.pending.is_some())
    }

    fn next(&mut self) -> Result<Option<TimeValuePair>> {
        if !self.has_next()? {
            return Ok(None);
        }
        Ok(self.pending.take())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        for source in self.sources.iter_mut() {
            source.close();
        }
        self.sources.clear();
        self.heap.clear();
        self.pending = None;
        self.closed = true;
    }
}

impl Drop for PriorityMergeReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ValueFilter;
    use crate::{Timestamp, TsValue};

    struct VecReader {
        points: std::vec::IntoIter<TimeValuePair>,
        peeked: Option<TimeValuePair>,
    }

    impl VecReader {
        fn boxed(points: Vec<(Timestamp, i64)>) -> Box<dyn PointReader> {
            Box::new(Self {
                points: points
                    .into_iter()
                    .map(|(t, v)| TimeValuePair::new(t, v))
                    .collect::<Vec<_>>()
                    .into_iter(),
                peeked: None,
            })
        }
    }

    impl PointReader for VecReader {
        fn has_next(&mut self) -> Result<bool> {
            if self.peeked.is_none() {
                self.peeked = self.points.next();
            }
            Ok(self.peeked.is_some())
        }

        fn next(&mut self) -> Result<Option<TimeValuePair>> {
            self.has_next()?;
            Ok(self.peeked.take())
        }

        fn close(&mut self) {
            self.peeked = None;
        }
    }

    fn collect(mut reader: PriorityMergeReader) -> Vec<(Timestamp, TsValue)> {
        reader
            .read_all()
            .unwrap()
            .into_iter()
            .map(|p| (p.timestamp, p.value))
            .collect()
    }

    #[test]
    fn test_memory_wins_collision() {
        let mut reader = PriorityMergeReader::new();
        reader
            .add_reader(VecReader::boxed(vec![(5, 1)]), Priority::new(SourceTier::SeqFile, 1))
            .unwrap();
        reader
            .add_reader(VecReader::boxed(vec![(5, 2)]), Priority::new(SourceTier::UnseqFile, 2))
            .unwrap();
        reader
            .add_reader(VecReader::boxed(vec![(5, 3)]), Priority::new(SourceTier::UnseqMemory, 3))
            .unwrap();

        assert_eq!(collect(reader), vec![(5, TsValue::Int64(3))]);
    }

    #[test]
    fn test_lane_outranks_source_kind() {
        let mut reader = PriorityMergeReader::new();
        // a frozen sequence memtable opened after the unsequence one
        reader
            .add_reader(VecReader::boxed(vec![(5, 1), (7, 1)]), Priority::new(SourceTier::SeqMemory, 3))
            .unwrap();
        reader
            .add_reader(VecReader::boxed(vec![(5, 2)]), Priority::new(SourceTier::UnseqMemory, 2))
            .unwrap();
        // flushed after the memtable above froze
        reader
            .add_reader(VecReader::boxed(vec![(7, 4)]), Priority::new(SourceTier::UnseqFile, 4))
            .unwrap();

        assert_eq!(
            collect(reader),
            vec![(5, TsValue::Int64(2)), (7, TsValue::Int64(4))]
        );
    }

    #[test]
    fn test_unseq_versions_order_files_and_memory() {
        let mut reader = PriorityMergeReader::new();
        // still flushing while a later unsequence file was sealed
        reader
            .add_reader(VecReader::boxed(vec![(5, 1)]), Priority::new(SourceTier::UnseqMemory, 2))
            .unwrap();
        reader
            .add_reader(VecReader::boxed(vec![(5, 2)]), Priority::new(SourceTier::UnseqFile, 4))
            .unwrap();

        assert_eq!(collect(reader), vec![(5, TsValue::Int64(2))]);
    }

    #[test]
    fn test_newer_unseq_version_wins() {
        let mut reader = PriorityMergeReader::new();
        reader
            .add_reader(
                VecReader::boxed(vec![(1, 10), (3, 30), (5, 50)]),
                Priority::new(SourceTier::UnseqFile, 7),
            )
            .unwrap();
        reader
            .add_reader(
                VecReader::boxed(vec![(2, 200), (3, 300), (6, 600)]),
                Priority::new(SourceTier::UnseqFile, 9),
            )
            .unwrap();

        let times: Vec<_> = collect(reader);
        assert_eq!(
            times,
            vec![
                (1, TsValue::Int64(10)),
                (2, TsValue::Int64(200)),
                (3, TsValue::Int64(300)),
                (5, TsValue::Int64(50)),
                (6, TsValue::Int64(600)),
            ]
        );
    }

    #[test]
    fn test_value_filter_applies_after_resolution() {
        // the filtered-out winner must not let the older value through
        let mut reader =
            PriorityMergeReader::new().with_filter(Filter::value(ValueFilter::Lt(100.0)));
        reader
            .add_reader(VecReader::boxed(vec![(1, 1), (2, 2)]), Priority::new(SourceTier::SeqFile, 1))
            .unwrap();
        reader
            .add_reader(VecReader::boxed(vec![(2, 500)]), Priority::new(SourceTier::SeqMemory, 2))
            .unwrap();

        assert_eq!(collect(reader), vec![(1, TsValue::Int64(1))]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut reader = PriorityMergeReader::new();
        reader
            .add_reader(VecReader::boxed(vec![(1, 1), (2, 2)]), Priority::new(SourceTier::SeqFile, 1))
            .unwrap();
        assert!(reader.has_next().unwrap());

        reader.close();
        reader.close();
        assert!(!reader.has_next().unwrap());
        assert!(reader
            .add_reader(VecReader::boxed(vec![]), Priority::new(SourceTier::SeqMemory, 0))
            .is_err());
    }
}
