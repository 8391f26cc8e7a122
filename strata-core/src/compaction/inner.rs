//! Inner-space, size-tiered selection

use super::{
    CompactionConfig, CompactionSelection, CompactionSelector, CompactionStrategy,
    CompactionTaskManager, PartitionHandle, PartitionPermit,
};
use crate::resource::TsFileResource;
use crate::Lane;
use std::sync::Arc;
use tracing::{error, info};

/// Merges contiguous runs of small files of one lane.
///
/// Files are scanned newest first. Closed, unclaimed files below the target
/// size are accumulated until the run reaches the target size; any other
/// file breaks the run. A run that never reached the target is still merged
/// if it holds more than one file.
pub struct SizeTieredSelector<'a> {
    partition: &'a PartitionHandle,
    lane: Lane,
    config: &'a CompactionConfig,
    manager: &'a CompactionTaskManager,
}

impl<'a> SizeTieredSelector<'a> {
    pub fn new(
        partition: &'a PartitionHandle,
        lane: Lane,
        config: &'a CompactionConfig,
        manager: &'a CompactionTaskManager,
    ) -> Self {
        Self {
            partition,
            lane,
            config,
            manager,
        }
    }

    fn admitted(&self) -> bool {
        self.manager.current_task_num() < self.config.concurrent_compaction_thread
            && self.config.is_lane_enabled(self.lane)
    }

    /// Claim `files` and hand them over; the caller holds the list read lock
    fn submit(&self, permit: PartitionPermit, files: Vec<Arc<TsFileResource>>) -> bool {
        for file in &files {
            file.set_merging(true);
        }
        info!(
            "{} [Compaction] submitting {} compaction of {} files",
            self.partition.key,
            self.lane,
            files.len()
        );

        let selection = match self.lane {
            Lane::Sequence => CompactionSelection {
                seq_files: files,
                ..Default::default()
            },
            Lane::Unsequence => CompactionSelection {
                unseq_files: files,
                ..Default::default()
            },
        };
        let task =
            CompactionStrategy::InnerSizeTiered.create_task(self.partition, self.lane, selection, 1);
        match self.manager.submit_task(permit, task) {
            Ok(()) => true,
            Err(e) => {
                error!("{} cannot submit inner compaction: {}", self.partition.key, e);
                false
            }
        }
    }
}

impl CompactionSelector for SizeTieredSelector<'_> {
    fn select_and_submit(&self) -> bool {
        let target_size = self.config.target_compaction_file_size;
        let guard = self.partition.list(self.lane).read();

        let mut permit = None;
        let mut selected = Vec::new();
        let mut selected_size = 0u64;

        for file in guard.reverse_iter() {
            if !self.admitted() {
                return false;
            }
            if permit.is_none() {
                permit = self.manager.try_reserve(&self.partition.key);
                if permit.is_none() {
                    return false;
                }
            }

            if file.file_size() >= target_size || file.is_merging() || !file.is_closed() {
                selected.clear();
                selected_size = 0;
                continue;
            }
            selected.push(Arc::clone(file));
            selected_size += file.file_size();

            if selected_size >= target_size {
                // the partition is compacting from here on, later runs wait
                return match permit.take() {
                    Some(permit) => self.submit(permit, selected),
                    None => false,
                };
            }
        }

        if selected.len() > 1 {
            if let Some(permit) = permit.take() {
                return self.submit(permit, selected);
            }
        }
        false
    }
}
