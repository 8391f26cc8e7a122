//! Background compaction
//!
//! Two strategies rewrite the files of a partition:
//!
//! - inner-space, size-tiered: merges a contiguous run of small files within
//!   one lane into a single file one level up
//! - cross-space, in-place: merges unsequence files into the sequence files
//!   they overlap, one target per selected sequence file
//!
//! Selectors run on the scheduling trigger, hand tasks to the
//! [`CompactionTaskManager`] worker pool and never block the write path.

mod cross;
mod inner;
mod log;
mod recover;
mod scheduler;
mod task;

pub use cross::{CrossSpaceMergeResource, InplaceSelector, MaxFileSelector};
pub use inner::SizeTieredSelector;
pub use log::{
    find_logs, log_file_name, MergeLogAnalysis, MergeLogEntry, MergeLogger, MergeStage,
    RetiredLog,
};
pub use recover::{recover_partition, MergeRecoverTask};
pub use scheduler::{
    schedule_compaction, CompactionResult, CompactionStats, CompactionTaskManager,
    PartitionPermit,
};
pub use task::{CompactionOutcome, CompactionTask};

use crate::resource::{TsFileResource, TsFileResourceList};
use crate::tsfile::TsFileConfig;
use crate::Lane;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Order in which a scheduling cycle tries the strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPriority {
    /// Alternate between inner and cross space until nothing is admitted
    Balance,
    InnerCross,
    CrossInner,
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enable_seq_space_compaction: bool,
    pub enable_unseq_space_compaction: bool,
    pub enable_cross_space_compaction: bool,
    /// Inner-space runs are accumulated until they reach this size
    pub target_compaction_file_size: u64,
    /// Worker pool size and admission cap on running tasks
    pub concurrent_compaction_thread: usize,
    /// Upper bound on the summed size of one cross-space selection
    pub merge_memory_budget: u64,
    /// Maximum unsequence candidates considered per cross-space cycle
    pub max_open_file_num_in_cross_space_compaction: usize,
    /// Cross-space targets written in parallel
    pub concurrent_merge_series: usize,
    pub compaction_priority: CompactionPriority,
    /// Period of the scheduling trigger
    pub compaction_interval_ms: u64,
    /// Unsequence files whose data all ended before `now - ttl` are not
    /// cross-space compacted
    pub data_ttl_ms: Option<i64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enable_seq_space_compaction: true,
            enable_unseq_space_compaction: true,
            enable_cross_space_compaction: true,
            target_compaction_file_size: 64 * 1024 * 1024, // 64MB
            concurrent_compaction_thread: 2,
            merge_memory_budget: 256 * 1024 * 1024, // 256MB
            max_open_file_num_in_cross_space_compaction: 100,
            concurrent_merge_series: 1,
            compaction_priority: CompactionPriority::Balance,
            compaction_interval_ms: 60_000,
            data_ttl_ms: None,
        }
    }
}

impl CompactionConfig {
    pub fn is_lane_enabled(&self, lane: Lane) -> bool {
        match lane {
            Lane::Sequence => self.enable_seq_space_compaction,
            Lane::Unsequence => self.enable_unseq_space_compaction,
        }
    }
}

/// Storage group and time partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub storage_group: String,
    pub partition: i64,
}

impl PartitionKey {
    pub fn new(storage_group: impl Into<String>, partition: i64) -> Self {
        Self {
            storage_group: storage_group.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.storage_group, self.partition)
    }
}

/// What a task merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionKind {
    InnerSpace { lane: Lane },
    CrossSpace,
}

impl CompactionKind {
    /// Lane the targets are written to
    pub fn target_lane(&self) -> Lane {
        match self {
            CompactionKind::InnerSpace { lane } => *lane,
            CompactionKind::CrossSpace => Lane::Sequence,
        }
    }
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionKind::InnerSpace { lane } => write!(f, "inner-{}", lane),
            CompactionKind::CrossSpace => f.write_str("cross"),
        }
    }
}

/// Files of one partition as seen by compaction
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    pub key: PartitionKey,
    pub dir: PathBuf,
    pub seq: Arc<TsFileResourceList>,
    pub unseq: Arc<TsFileResourceList>,
    pub tsfile_config: TsFileConfig,
}

impl PartitionHandle {
    pub fn list(&self, lane: Lane) -> &Arc<TsFileResourceList> {
        match lane {
            Lane::Sequence => &self.seq,
            Lane::Unsequence => &self.unseq,
        }
    }

    pub fn lane_dir(&self, lane: Lane) -> PathBuf {
        self.dir.join(lane.dir_name())
    }

    /// Path as recorded in a merge log
    pub(crate) fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.dir).unwrap_or(path)
    }
}

/// Files chosen by a selector, oldest first within each lane
#[derive(Debug, Clone, Default)]
pub struct CompactionSelection {
    pub seq_files: Vec<Arc<TsFileResource>>,
    pub unseq_files: Vec<Arc<TsFileResource>>,
    /// Metadata view built by cross-space selection
    pub resource: Option<Arc<CrossSpaceMergeResource>>,
}

impl CompactionSelection {
    pub fn all_files(&self) -> impl Iterator<Item = &Arc<TsFileResource>> {
        self.seq_files.iter().chain(self.unseq_files.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.seq_files.is_empty() && self.unseq_files.is_empty()
    }
}

/// Selection policy of one strategy
pub trait CompactionSelector {
    /// Select files and hand a task to the manager; true iff one was admitted
    fn select_and_submit(&self) -> bool;
}

/// Available compaction strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    InnerSizeTiered,
    CrossInplace,
}

impl CompactionStrategy {
    /// Selector for `partition`; `lane` only matters for inner-space
    pub fn selector<'a>(
        &self,
        partition: &'a PartitionHandle,
        lane: Lane,
        config: &'a CompactionConfig,
        manager: &'a CompactionTaskManager,
    ) -> Box<dyn CompactionSelector + 'a> {
        match self {
            CompactionStrategy::InnerSizeTiered => {
                Box::new(SizeTieredSelector::new(partition, lane, config, manager))
            }
            CompactionStrategy::CrossInplace => {
                Box::new(InplaceSelector::new(partition, config, manager))
            }
        }
    }

    /// Task over already selected (and claimed) files
    pub fn create_task(
        &self,
        partition: &PartitionHandle,
        lane: Lane,
        selection: CompactionSelection,
        concurrency: usize,
    ) -> CompactionTask {
        match self {
            CompactionStrategy::InnerSizeTiered => {
                let sources = match lane {
                    Lane::Sequence => selection.seq_files,
                    Lane::Unsequence => selection.unseq_files,
                };
                CompactionTask::inner(partition.clone(), lane, sources)
            }
            CompactionStrategy::CrossInplace => CompactionTask::cross(
                partition.clone(),
                selection.seq_files,
                selection.unseq_files,
                selection.resource,
                concurrency,
            ),
        }
    }

    /// Recovery of an interrupted task; the log records which strategy ran
    pub fn create_recover_task(
        &self,
        log_path: impl AsRef<Path>,
        partition_dir: impl AsRef<Path>,
    ) -> MergeRecoverTask {
        MergeRecoverTask::new(log_path, partition_dir)
    }
}
