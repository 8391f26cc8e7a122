//! Cross-space, in-place selection
//!
//! Unsequence files are merged into the sequence files their data falls
//! into. Which sequence files an unsequence file needs is decided per device
//! from the time ranges alone, so selection never reads file content.

use super::{
    CompactionConfig, CompactionSelection, CompactionSelector, CompactionStrategy,
    CompactionTaskManager, PartitionHandle,
};
use crate::resource::TsFileResource;
use crate::{Lane, Result, SeriesKey, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Candidate files of one cross-space cycle plus lazily read metadata
pub struct CrossSpaceMergeResource {
    seq_files: Vec<Arc<TsFileResource>>,
    unseq_files: Vec<Arc<TsFileResource>>,
    time_lower_bound: Option<Timestamp>,
    cache_series: AtomicBool,
    series_cache: Mutex<HashMap<PathBuf, Arc<Vec<SeriesKey>>>>,
}

impl CrossSpaceMergeResource {
    /// `time_lower_bound` of `None` keeps every file eligible
    pub fn new(
        seq_files: Vec<Arc<TsFileResource>>,
        unseq_files: Vec<Arc<TsFileResource>>,
        time_lower_bound: Option<Timestamp>,
    ) -> Self {
        Self {
            seq_files,
            unseq_files,
            time_lower_bound,
            cache_series: AtomicBool::new(false),
            series_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn seq_files(&self) -> &[Arc<TsFileResource>] {
        &self.seq_files
    }

    pub fn unseq_files(&self) -> &[Arc<TsFileResource>] {
        &self.unseq_files
    }

    pub fn time_lower_bound(&self) -> Option<Timestamp> {
        self.time_lower_bound
    }

    /// Narrow the view to the chosen files
    pub fn retain(&mut self, seq: &[usize], unseq: &[usize]) {
        self.seq_files = seq.iter().map(|&i| Arc::clone(&self.seq_files[i])).collect();
        self.unseq_files = unseq
            .iter()
            .map(|&i| Arc::clone(&self.unseq_files[i]))
            .collect();
    }

    /// Check if all data of `file` is older than the lower bound
    pub fn is_expired(&self, file: &TsFileResource) -> bool {
        self.time_lower_bound
            .map_or(false, |bound| file.ends_before(bound))
    }

    /// Start caching series lists; only set once candidates are final
    pub fn set_cache_series(&self, cache: bool) {
        self.cache_series.store(cache, Ordering::Release);
    }

    /// Series stored in `file`
    pub fn series(&self, file: &TsFileResource) -> Result<Arc<Vec<SeriesKey>>> {
        if let Some(cached) = self.series_cache.lock().get(file.path()) {
            return Ok(Arc::clone(cached));
        }
        let series = Arc::new(file.reader()?.series());
        if self.cache_series.load(Ordering::Acquire) {
            self.series_cache
                .lock()
                .insert(file.path().to_path_buf(), Arc::clone(&series));
        }
        Ok(series)
    }

    /// Drop cached metadata
    pub fn clear(&self) {
        self.series_cache.lock().clear();
    }

    /// Indices of the sequence files `unseq` must be merged with.
    ///
    /// Per device: every holder overlapping the unsequence range, plus the
    /// first holder ending at or after it (or the last holder if none does).
    /// A device no sequence file holds needs the last sequence file.
    pub fn needed_seq_files(&self, unseq: &TsFileResource) -> BTreeSet<usize> {
        let mut needed = BTreeSet::new();
        for (device, range) in unseq.device_ranges() {
            let holders: Vec<usize> = self
                .seq_files
                .iter()
                .enumerate()
                .filter(|(_, f)| f.contains_device(&device))
                .map(|(i, _)| i)
                .collect();

            let Some(&last_holder) = holders.last() else {
                if let Some(last) = self.seq_files.len().checked_sub(1) {
                    needed.insert(last);
                }
                continue;
            };

            for &i in &holders {
                if self.seq_files[i].overlaps(&device, &range) {
                    needed.insert(i);
                }
            }
            let covering = holders.iter().copied().find(|&i| {
                self.seq_files[i]
                    .end_time(&device)
                    .map_or(false, |end| end >= range.end)
            });
            needed.insert(covering.unwrap_or(last_holder));
        }
        needed
    }
}

impl std::fmt::Debug for CrossSpaceMergeResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossSpaceMergeResource")
            .field("seq_files", &self.seq_files.len())
            .field("unseq_files", &self.unseq_files.len())
            .field("time_lower_bound", &self.time_lower_bound)
            .finish()
    }
}

fn files_overlap(a: &TsFileResource, b: &TsFileResource) -> bool {
    a.device_ranges()
        .iter()
        .any(|(device, range)| b.overlaps(device, range))
}

/// Picks as many unsequence files as fit the budget, oldest first
#[derive(Debug, Clone)]
pub struct MaxFileSelector {
    budget: u64,
}

impl MaxFileSelector {
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }

    /// Choose files from `resource`; `None` if nothing fits.
    ///
    /// An unsequence file is passed over when it is open, merging, expired,
    /// needs an open or merging sequence file, or would exceed the budget.
    /// Once passed over, no newer unsequence file overlapping it may be
    /// chosen, since moving the newer data below it would invert priorities.
    pub fn select(&self, resource: &CrossSpaceMergeResource) -> Option<(Vec<usize>, Vec<usize>)> {
        let mut seq_selected = BTreeSet::new();
        let mut unseq_selected = Vec::new();
        let mut skipped: Vec<&Arc<TsFileResource>> = Vec::new();
        let mut total_cost = 0u64;

        for (index, unseq) in resource.unseq_files().iter().enumerate() {
            let blocked = skipped.iter().any(|s| files_overlap(s, unseq));
            if blocked || !unseq.is_closed() || unseq.is_merging() || resource.is_expired(unseq) {
                skipped.push(unseq);
                continue;
            }

            let needed = resource.needed_seq_files(unseq);
            let unavailable = needed.iter().any(|&i| {
                let seq = &resource.seq_files()[i];
                !seq.is_closed() || seq.is_merging()
            });
            if unavailable {
                skipped.push(unseq);
                continue;
            }

            let cost = unseq.file_size()
                + needed
                    .iter()
                    .filter(|i| !seq_selected.contains(*i))
                    .map(|&i| resource.seq_files()[i].file_size())
                    .sum::<u64>();
            if total_cost + cost > self.budget {
                debug!(
                    "Skipping {:?}: cost {} exceeds remaining budget {}",
                    unseq.path(),
                    cost,
                    self.budget - total_cost
                );
                skipped.push(unseq);
                continue;
            }

            total_cost += cost;
            seq_selected.extend(needed);
            unseq_selected.push(index);
        }

        if unseq_selected.is_empty() {
            return None;
        }
        Some((seq_selected.into_iter().collect(), unseq_selected))
    }
}

/// Cross-space selector of one partition
pub struct InplaceSelector<'a> {
    partition: &'a PartitionHandle,
    config: &'a CompactionConfig,
    manager: &'a CompactionTaskManager,
}

impl<'a> InplaceSelector<'a> {
    pub fn new(
        partition: &'a PartitionHandle,
        config: &'a CompactionConfig,
        manager: &'a CompactionTaskManager,
    ) -> Self {
        Self {
            partition,
            config,
            manager,
        }
    }

    fn time_lower_bound(&self) -> Option<Timestamp> {
        self.config
            .data_ttl_ms
            .map(|ttl| chrono::Utc::now().timestamp_millis().saturating_sub(ttl))
    }
}

impl CompactionSelector for InplaceSelector<'_> {
    fn select_and_submit(&self) -> bool {
        if self.manager.current_task_num() >= self.config.concurrent_compaction_thread
            || !self.config.enable_cross_space_compaction
        {
            return false;
        }
        let Some(permit) = self.manager.try_reserve(&self.partition.key) else {
            return false;
        };

        let seq_guard = self.partition.seq.read();
        let unseq_guard = self.partition.unseq.read();
        let seq_files = seq_guard.snapshot();
        let mut unseq_files = unseq_guard.snapshot();
        if seq_files.is_empty() || unseq_files.is_empty() {
            return false;
        }
        unseq_files.truncate(self.config.max_open_file_num_in_cross_space_compaction);

        let budget = self.config.merge_memory_budget;
        let mut resource =
            CrossSpaceMergeResource::new(seq_files, unseq_files, self.time_lower_bound());
        let Some((seq, unseq)) = MaxFileSelector::new(budget).select(&resource) else {
            info!(
                "{} cannot select cross-space candidates under the budget {}",
                self.partition.key, budget
            );
            return false;
        };
        resource.retain(&seq, &unseq);
        resource.clear();
        resource.set_cache_series(true);

        let resource = Arc::new(resource);
        let selection = CompactionSelection {
            seq_files: resource.seq_files().to_vec(),
            unseq_files: resource.unseq_files().to_vec(),
            resource: Some(Arc::clone(&resource)),
        };
        for file in selection.all_files() {
            file.set_merging(true);
        }
        let concurrency = self
            .config
            .concurrent_merge_series
            .min(selection.seq_files.len())
            .max(1);
        let task = CompactionStrategy::CrossInplace.create_task(
            self.partition,
            Lane::Sequence,
            selection,
            concurrency,
        );
        drop(unseq_guard);
        drop(seq_guard);

        match self.manager.submit_task(permit, task) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "{} cannot submit cross-space compaction: {}",
                    self.partition.key, e
                );
                false
            }
        }
    }
}
