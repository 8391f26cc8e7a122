//! Append-only time/value list with on-demand sorting
//!
//! Writes land in arrival order. Sorting happens lazily when a reader or the
//! flusher asks for a sorted view; equal timestamps collapse to the value that
//! was written last.

use crate::{TimeRange, TimeValuePair, Timestamp, TsValue};

#[derive(Debug, Clone)]
pub struct TvList {
    times: Vec<Timestamp>,
    values: Vec<TsValue>,
    /// Strictly increasing timestamps, no duplicates
    sorted: bool,
    min_time: Timestamp,
    max_time: Timestamp,
    mem_cost: usize,
}

impl TvList {
    pub fn new() -> Self {
        Self {
            times: Vec::new(),
            values: Vec::new(),
            sorted: true,
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
            mem_cost: 0,
        }
    }

    /// Append a point, returning its approximate memory cost
    pub fn put(&mut self, timestamp: Timestamp, value: TsValue) -> usize {
        if let Some(&last) = self.times.last() {
            if timestamp <= last {
                self.sorted = false;
            }
        }
        self.min_time = self.min_time.min(timestamp);
        self.max_time = self.max_time.max(timestamp);

        let cost = 8 + value.size();
        self.mem_cost += cost;
        self.times.push(timestamp);
        self.values.push(value);
        cost
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn mem_cost(&self) -> usize {
        self.mem_cost
    }

    /// Covered time range, `None` when empty
    pub fn time_range(&self) -> Option<TimeRange> {
        (!self.is_empty()).then(|| TimeRange::new(self.min_time, self.max_time))
    }

    pub fn time(&self, index: usize) -> Timestamp {
        self.times[index]
    }

    pub fn value(&self, index: usize) -> &TsValue {
        &self.values[index]
    }

    /// Iterate in storage order (time order once sorted)
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, &TsValue)> {
        self.times.iter().copied().zip(self.values.iter())
    }

    /// Sort by time; on equal timestamps keep the latest write
    pub fn sort_and_dedup(&mut self) {
        if self.sorted {
            return;
        }

        let mut entries: Vec<(Timestamp, TsValue)> = self
            .times
            .drain(..)
            .zip(self.values.drain(..))
            .collect();
        // stable: arrival order survives among equal timestamps
        entries.sort_by_key(|(t, _)| *t);

        let mut deduped: Vec<(Timestamp, TsValue)> = Vec::with_capacity(entries.len());
        for (t, v) in entries {
            match deduped.last_mut() {
                Some(last) if last.0 == t => last.1 = v,
                _ => deduped.push((t, v)),
            }
        }

        self.mem_cost = deduped.iter().map(|(_, v)| 8 + v.size()).sum();
        for (t, v) in deduped {
            self.times.push(t);
            self.values.push(v);
        }
        self.sorted = true;
    }

    /// Remove every point inside `range`, returning how many were removed
    pub fn delete(&mut self, range: &TimeRange) -> usize {
        let before = self.times.len();
        let mut times = Vec::with_capacity(before);
        let mut values = Vec::with_capacity(before);
        let mut mem_cost = 0;
        let mut min_time = Timestamp::MAX;
        let mut max_time = Timestamp::MIN;

        for (t, v) in self.times.drain(..).zip(self.values.drain(..)) {
            if range.contains(t) {
                continue;
            }
            mem_cost += 8 + v.size();
            min_time = min_time.min(t);
            max_time = max_time.max(t);
            times.push(t);
            values.push(v);
        }

        self.times = times;
        self.values = values;
        self.mem_cost = mem_cost;
        self.min_time = min_time;
        self.max_time = max_time;
        before - self.times.len()
    }

    /// Whether any point may fall inside `range`
    pub fn may_overlap(&self, range: &TimeRange) -> bool {
        self.time_range().map_or(false, |r| r.overlaps(range))
    }

    pub fn to_pairs(&self) -> Vec<TimeValuePair> {
        self.iter()
            .map(|(t, v)| TimeValuePair {
                timestamp: t,
                value: v.clone(),
            })
            .collect()
    }
}

impl Default for TvList {
    fn default() -> Self {
        Self::new()
    }
}
