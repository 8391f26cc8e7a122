//! Compaction task execution
//!
//! A task runs in logged stages:
//!
//! 1. task header, source lists, target names, deletion counts of every source
//! 2. merge start
//! 3. per series: series start, merged points written to `<target>.merge`,
//!    file position, series end
//! 4. all series end, once every target is synced
//! 5. swap: targets renamed and loaded, late deletions copied, sources
//!    replaced under the list write locks
//! 6. merge end, then sources are retired
//!
//! Any failure before the lists are swapped removes the targets and the log,
//! leaving the partition exactly as it was.

use super::log::{log_file_name, MergeLogEntry, MergeLogger, RetiredLog};
use super::{CompactionKind, CrossSpaceMergeResource, PartitionHandle, PartitionKey};
use crate::query::{FileSeriesReader, PointReader, Priority, PriorityMergeReader, SourceTier};
use crate::resource::TsFileResource;
use crate::tsfile::{self, TsFileName, TsFileSummary, TsFileWriter};
use crate::{DataType, Lane, Result, SeriesKey, StrataError, TimeRange, Timestamp};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary of a finished task
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub task_id: Uuid,
    pub kind: CompactionKind,
    pub partition: PartitionKey,
    pub source_files: usize,
    pub target_files: usize,
    pub points_written: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

struct TargetPlan {
    final_path: PathBuf,
    temp_path: PathBuf,
}

/// One merge over claimed files of a partition
pub struct CompactionTask {
    id: Uuid,
    kind: CompactionKind,
    partition: PartitionHandle,
    seq_files: Vec<Arc<TsFileResource>>,
    unseq_files: Vec<Arc<TsFileResource>>,
    resource: Option<Arc<CrossSpaceMergeResource>>,
    concurrency: usize,
}

impl CompactionTask {
    /// Merge a run of files of one lane into one file
    pub fn inner(partition: PartitionHandle, lane: Lane, mut sources: Vec<Arc<TsFileResource>>) -> Self {
        sources.sort_by_key(|f| f.version());
        let (seq_files, unseq_files) = match lane {
            Lane::Sequence => (sources, Vec::new()),
            Lane::Unsequence => (Vec::new(), sources),
        };
        Self {
            id: Uuid::new_v4(),
            kind: CompactionKind::InnerSpace { lane },
            partition,
            seq_files,
            unseq_files,
            resource: None,
            concurrency: 1,
        }
    }

    /// Merge unsequence files into the sequence files they overlap
    pub fn cross(
        partition: PartitionHandle,
        mut seq_files: Vec<Arc<TsFileResource>>,
        mut unseq_files: Vec<Arc<TsFileResource>>,
        resource: Option<Arc<CrossSpaceMergeResource>>,
        concurrency: usize,
    ) -> Self {
        seq_files.sort_by_key(|f| f.version());
        unseq_files.sort_by_key(|f| f.version());
        Self {
            id: Uuid::new_v4(),
            kind: CompactionKind::CrossSpace,
            partition,
            seq_files,
            unseq_files,
            resource,
            concurrency: concurrency.max(1),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> CompactionKind {
        self.kind
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition.key
    }

    pub fn seq_files(&self) -> &[Arc<TsFileResource>] {
        &self.seq_files
    }

    pub fn unseq_files(&self) -> &[Arc<TsFileResource>] {
        &self.unseq_files
    }

    pub fn source_files(&self) -> impl Iterator<Item = &Arc<TsFileResource>> {
        self.seq_files.iter().chain(self.unseq_files.iter())
    }

    /// Run the task to completion
    pub fn execute(&self) -> Result<CompactionOutcome> {
        let started = Instant::now();
        let sources: Vec<_> = self.source_files().cloned().collect();
        if sources.is_empty() {
            return Err(StrataError::Compaction(format!("task {} has no sources", self.id)));
        }
        info!(
            "Compaction {} ({}) on {}: {} seq, {} unseq files",
            self.id,
            self.kind,
            self.partition.key,
            self.seq_files.len(),
            self.unseq_files.len()
        );

        let targets = self.plan_targets();
        let log_path = self.partition.dir.join(log_file_name(&self.id));
        let mut logger = MergeLogger::create(&log_path)?;
        let mods_snapshot: Vec<(Arc<TsFileResource>, usize)> = sources
            .iter()
            .map(|s| (Arc::clone(s), s.mods().len()))
            .collect();

        let (installed, points_written) =
            match self.run(&mut logger, &targets, &mods_snapshot) {
                Ok(done) => done,
                Err(e) => {
                    drop(logger);
                    self.rollback(&targets, &log_path);
                    return Err(e);
                }
            };

        if let Err(e) = logger.log_merge_end() {
            warn!("Compaction {} could not log merge end: {}", self.id, e);
        }
        drop(logger);

        let retired = Arc::new(RetiredLog::new(&log_path));
        for source in &sources {
            source.retire(Arc::clone(&retired));
        }

        let outcome = CompactionOutcome {
            task_id: self.id,
            kind: self.kind,
            partition: self.partition.key.clone(),
            source_files: sources.len(),
            target_files: installed.len(),
            points_written,
            bytes_written: installed.iter().map(|t| t.file_size()).sum(),
            elapsed: started.elapsed(),
        };
        info!(
            "Compaction {} finished: {} -> {} files, {} points in {:?}",
            self.id, outcome.source_files, outcome.target_files, outcome.points_written, outcome.elapsed
        );
        Ok(outcome)
    }

    fn run(
        &self,
        logger: &mut MergeLogger,
        targets: &[TargetPlan],
        mods_snapshot: &[(Arc<TsFileResource>, usize)],
    ) -> Result<(Vec<Arc<TsFileResource>>, u64)> {
        let relative = |p: &Path| self.partition.relative(p).to_path_buf();

        logger.log(&MergeLogEntry::Task {
            kind: self.kind,
            partition: self.partition.key.clone(),
        })?;
        logger.log_seq_files(self.seq_files.iter().map(|f| relative(f.path())).collect())?;
        logger.log_unseq_files(self.unseq_files.iter().map(|f| relative(f.path())).collect())?;
        logger.log(&MergeLogEntry::Targets(
            targets.iter().map(|t| relative(&t.final_path)).collect(),
        ))?;
        logger.log(&MergeLogEntry::ModsSnapshot(
            mods_snapshot
                .iter()
                .map(|(s, count)| (relative(s.path()), *count))
                .collect(),
        ))?;
        logger.log_merge_start()?;

        let written = self.merge(logger, targets)?;
        logger.log_all_series_end()?;

        let points = written.iter().map(|s| s.point_count as u64).sum();
        let installed = self.install(targets, written)?;
        self.swap(&installed, mods_snapshot)?;
        Ok((installed, points))
    }

    fn plan_targets(&self) -> Vec<TargetPlan> {
        let names: Vec<(Lane, TsFileName)> = match self.kind {
            CompactionKind::InnerSpace { lane } => {
                let sources = self.lane_sources(lane);
                let version = sources.iter().map(|f| f.version()).max().unwrap_or_default();
                let level = sources.iter().map(|f| f.level()).max().unwrap_or_default();
                vec![(lane, TsFileName::new(version, level + 1))]
            }
            CompactionKind::CrossSpace => self
                .seq_files
                .iter()
                .map(|f| (Lane::Sequence, TsFileName::new(f.version(), f.level() + 1)))
                .collect(),
        };

        names
            .into_iter()
            .map(|(lane, name)| {
                let final_path = self.partition.lane_dir(lane).join(name.file_name());
                TargetPlan {
                    temp_path: tsfile::merge_temp_path(&final_path),
                    final_path,
                }
            })
            .collect()
    }

    fn lane_sources(&self, lane: Lane) -> &[Arc<TsFileResource>] {
        match lane {
            Lane::Sequence => &self.seq_files,
            Lane::Unsequence => &self.unseq_files,
        }
    }

    /// Write every target, in parallel for cross-space tasks
    fn merge(&self, logger: &mut MergeLogger, targets: &[TargetPlan]) -> Result<Vec<TsFileSummary>> {
        let logger = Mutex::new(logger);
        let workers = self.concurrency.min(targets.len()).max(1);
        if workers == 1 {
            return targets
                .iter()
                .enumerate()
                .map(|(index, plan)| self.write_target(index, plan, &logger))
                .collect();
        }

        let mut results: Vec<(usize, Result<TsFileSummary>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let logger = &logger;
                    scope.spawn(move || {
                        targets
                            .iter()
                            .enumerate()
                            .skip(worker)
                            .step_by(workers)
                            .map(|(index, plan)| (index, self.write_target(index, plan, logger)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| {
                    h.join().unwrap_or_else(|_| {
                        vec![(
                            usize::MAX,
                            Err(StrataError::Compaction("merge worker panicked".into())),
                        )]
                    })
                })
                .collect()
        });
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, r)| r).collect()
    }

    fn write_target(
        &self,
        index: usize,
        plan: &TargetPlan,
        logger: &Mutex<&mut MergeLogger>,
    ) -> Result<TsFileSummary> {
        let relative = self.partition.relative(&plan.final_path).to_path_buf();
        let mut writer = TsFileWriter::create(&plan.temp_path, self.partition.tsfile_config.clone())?;

        for series in self.target_series(index)? {
            let Some(range) = self.window(index, &series.device) else {
                continue;
            };
            let mut reader = self.series_reader(index, &series, range)?;
            if !reader.has_next()? {
                continue;
            }
            let data_type = self.data_type(index, &series)?;

            logger.lock().log_series_start(&series)?;
            writer.start_series(&series, data_type)?;
            while let Some(point) = reader.next()? {
                writer.write_point(point)?;
            }
            writer.end_series()?;
            let mut logger = logger.lock();
            logger.log_file_position(relative.clone(), writer.position())?;
            logger.log_series_end(&series)?;
        }

        let summary = writer.finish()?;
        debug!(
            "Compaction {} wrote {:?}: {} series, {} points",
            self.id, plan.temp_path, summary.series_count, summary.point_count
        );
        Ok(summary)
    }

    /// Sources feeding target `index`
    fn target_sources(&self, index: usize) -> Vec<&Arc<TsFileResource>> {
        match self.kind {
            CompactionKind::InnerSpace { .. } => self.source_files().collect(),
            CompactionKind::CrossSpace => self
                .seq_files
                .get(index)
                .into_iter()
                .chain(self.unseq_files.iter())
                .collect(),
        }
    }

    fn target_series(&self, index: usize) -> Result<BTreeSet<SeriesKey>> {
        let mut series = BTreeSet::new();
        for file in self.target_sources(index) {
            match &self.resource {
                Some(resource) => series.extend(resource.series(file)?.iter().cloned()),
                None => series.extend(file.reader()?.series()),
            }
        }
        Ok(series)
    }

    /// Time window of `device` routed to target `index`.
    ///
    /// Cross-space targets split each device's timeline at the end times of
    /// the selected sequence files holding it: a point goes to the first such
    /// file ending at or after it, else to the last one. Devices held by no
    /// selected file go to the last target.
    fn window(&self, index: usize, device: &str) -> Option<TimeRange> {
        if matches!(self.kind, CompactionKind::InnerSpace { .. }) {
            return Some(TimeRange::all());
        }

        let holders: Vec<usize> = self
            .seq_files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.contains_device(device))
            .map(|(i, _)| i)
            .collect();
        if holders.is_empty() {
            return (index + 1 == self.seq_files.len()).then(TimeRange::all);
        }

        let position = holders.iter().position(|&i| i == index)?;
        let start = match position {
            0 => Timestamp::MIN,
            _ => self.seq_files[holders[position - 1]]
                .end_time(device)?
                .saturating_add(1),
        };
        let end = if position + 1 == holders.len() {
            Timestamp::MAX
        } else {
            self.seq_files[index].end_time(device)?
        };
        Some(TimeRange::new(start, end))
    }

    fn series_reader(
        &self,
        index: usize,
        series: &SeriesKey,
        range: TimeRange,
    ) -> Result<PriorityMergeReader> {
        let mut reader = PriorityMergeReader::new();
        for file in self.target_sources(index) {
            if !file.overlaps(&series.device, &range) {
                continue;
            }
            let tier = match file.lane() {
                Lane::Sequence => SourceTier::SeqFile,
                Lane::Unsequence => SourceTier::UnseqFile,
            };
            reader.add_reader(
                Box::new(FileSeriesReader::new(Arc::clone(file), series, range)),
                Priority::new(tier, file.version()),
            )?;
        }
        Ok(reader)
    }

    fn data_type(&self, index: usize, series: &SeriesKey) -> Result<DataType> {
        for file in self.target_sources(index) {
            if let Some(data_type) = file.reader()?.data_type(series) {
                return Ok(data_type);
            }
        }
        Err(StrataError::Compaction(format!("no source holds {}", series)))
    }

    /// Rename finished targets into place and load them; empty targets are dropped
    fn install(
        &self,
        targets: &[TargetPlan],
        written: Vec<TsFileSummary>,
    ) -> Result<Vec<Arc<TsFileResource>>> {
        let lane = self.kind.target_lane();
        let mut installed = Vec::with_capacity(targets.len());
        for (plan, summary) in targets.iter().zip(written) {
            if summary.series_count == 0 {
                std::fs::remove_file(&plan.temp_path)?;
                continue;
            }
            std::fs::rename(&plan.temp_path, &plan.final_path)?;
            installed.push(Arc::new(TsFileResource::new_closed(
                &plan.final_path,
                lane,
                summary.device_ranges,
                summary.file_size,
            )?));
        }
        Ok(installed)
    }

    /// Replace sources by targets in the partition lists
    fn swap(
        &self,
        targets: &[Arc<TsFileResource>],
        mods_snapshot: &[(Arc<TsFileResource>, usize)],
    ) -> Result<()> {
        let mut seq = self.partition.seq.write();
        let mut unseq = self.partition.unseq.write();

        // deletions recorded while the merge ran are not in the targets yet
        for (source, count) in mods_snapshot {
            for deletion in source.mods().deletions_since(*count) {
                for target in targets {
                    if !target.mods().deletions().contains(&deletion) {
                        target.append_deletion(deletion.clone())?;
                    }
                }
            }
        }

        match self.kind {
            CompactionKind::InnerSpace { lane: Lane::Sequence } => {
                seq.replace(&self.seq_files, targets.to_vec());
            }
            CompactionKind::InnerSpace { lane: Lane::Unsequence } => {
                unseq.replace(&self.unseq_files, targets.to_vec());
            }
            CompactionKind::CrossSpace => {
                seq.replace(&self.seq_files, targets.to_vec());
                unseq.replace(&self.unseq_files, Vec::new());
            }
        }
        Ok(())
    }

    fn rollback(&self, targets: &[TargetPlan], log_path: &Path) {
        for plan in targets {
            for path in [
                plan.temp_path.clone(),
                plan.final_path.clone(),
                tsfile::resource_path(&plan.final_path),
                tsfile::mods_path(&plan.final_path),
            ] {
                remove_if_exists(&path);
            }
        }
        remove_if_exists(log_path);
        warn!("Compaction {} rolled back on {}", self.id, self.partition.key);
    }
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

impl std::fmt::Debug for CompactionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("partition", &self.partition.key)
            .field("seq_files", &self.seq_files.len())
            .field("unseq_files", &self.unseq_files.len())
            .finish()
    }
}
