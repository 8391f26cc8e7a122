//! Restart-time recovery of interrupted compactions
//!
//! Runs before any file of the partition is loaded, so it works on the
//! directory alone:
//!
//! - not started or partially written: the targets are incomplete, remove
//!   them and forget the task; the sources were never touched
//! - complete: the targets are whole, finish the swap by moving them into
//!   place, carrying late deletions over and removing the sources
//!
//! Every step checks what exists before acting, so recovering the same log
//! twice leaves the directory as the first run did.

use super::log::{find_logs, MergeLogAnalysis, MergeStage};
use crate::resource::ModificationFile;
use crate::tsfile::{self, MERGE_SUFFIX};
use crate::{Lane, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Recovery of one merge log
#[derive(Debug)]
pub struct MergeRecoverTask {
    log_path: PathBuf,
    partition_dir: PathBuf,
}

impl MergeRecoverTask {
    pub fn new(log_path: impl AsRef<Path>, partition_dir: impl AsRef<Path>) -> Self {
        Self {
            log_path: log_path.as_ref().to_path_buf(),
            partition_dir: partition_dir.as_ref().to_path_buf(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Bring the partition directory to a state without the task in flight
    pub fn recover(&self) -> Result<MergeStage> {
        let analysis = MergeLogAnalysis::analyze(&self.log_path)?;
        info!(
            "Recovering compaction log {:?}: {:?}, {} seq, {} unseq, {} targets",
            self.log_path,
            analysis.stage,
            analysis.seq_files.len(),
            analysis.unseq_files.len(),
            analysis.targets.len()
        );

        match analysis.stage {
            MergeStage::NotStarted | MergeStage::Partial => self.discard(&analysis)?,
            MergeStage::Complete => self.finish_swap(&analysis)?,
        }

        remove_if_exists(&self.log_path)?;
        Ok(analysis.stage)
    }

    fn discard(&self, analysis: &MergeLogAnalysis) -> Result<()> {
        if let Some(series) = &analysis.unfinished_series {
            debug!("Compaction stopped while writing {}", series);
        }
        for target in &analysis.targets {
            let temp = tsfile::merge_temp_path(&self.partition_dir.join(target));
            if remove_if_exists(&temp)? {
                info!("Removed incomplete compaction target {:?}", temp);
            }
        }
        Ok(())
    }

    fn finish_swap(&self, analysis: &MergeLogAnalysis) -> Result<()> {
        let mut live_targets = Vec::with_capacity(analysis.targets.len());
        for target in &analysis.targets {
            let path = self.partition_dir.join(target);
            let temp = tsfile::merge_temp_path(&path);
            if temp.exists() {
                std::fs::rename(&temp, &path)?;
                debug!("Moved compaction target {:?} into place", path);
            }
            // absent when the target came out empty or was compacted again since
            if path.exists() {
                live_targets.push(path);
            }
        }

        // deletions must reach the targets before the sources holding them go
        let targets: Vec<ModificationFile> = live_targets
            .iter()
            .map(|path| ModificationFile::open(tsfile::mods_path(path)))
            .collect::<Result<_>>()?;
        for (source, count) in &analysis.mods_snapshot {
            let source_mods =
                ModificationFile::open(tsfile::mods_path(&self.partition_dir.join(source)))?;
            for deletion in source_mods.deletions_since(*count) {
                for target in &targets {
                    if !target.deletions().contains(&deletion) {
                        target.append(deletion.clone())?;
                    }
                }
            }
        }

        let mut removed = 0;
        for source in analysis.seq_files.iter().chain(&analysis.unseq_files) {
            let path = self.partition_dir.join(source);
            if live_targets.contains(&path) {
                warn!("Compaction source {:?} is also a target, keeping it", path);
                continue;
            }
            if remove_if_exists(&path)? {
                removed += 1;
            }
            remove_if_exists(&tsfile::resource_path(&path))?;
            remove_if_exists(&tsfile::mods_path(&path))?;
        }
        info!(
            "Finished interrupted compaction: {} targets in place, {} sources removed",
            live_targets.len(),
            removed
        );
        Ok(())
    }
}

/// Recover every merge log of a partition, oldest first, then drop stray
/// compaction targets no log refers to. Returns the number of logs handled.
pub fn recover_partition(partition_dir: &Path) -> Result<usize> {
    let logs = find_logs(partition_dir)?;
    for log in &logs {
        MergeRecoverTask::new(log, partition_dir).recover()?;
    }

    for lane in [Lane::Sequence, Lane::Unsequence] {
        let dir = partition_dir.join(lane.dir_name());
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(MERGE_SUFFIX));
            if is_temp {
                warn!("Removing orphan compaction target {:?}", path);
                remove_if_exists(&path)?;
            }
        }
    }
    Ok(logs.len())
}

/// Returns whether the file existed
fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::test_util::{partition, write_file};
    use crate::compaction::{
        log_file_name, CompactionKind, MergeLogEntry, MergeLogger, PartitionHandle,
    };
    use crate::query::{FileSeriesReader, PointReader};
    use crate::resource::{Deletion, TsFileResource};
    use crate::tsfile::TsFileName;
    use crate::{SeriesKey, TimeRange};
    use std::sync::Arc;
    use tempfile::tempdir;

    const D1: [(&str, &str); 1] = [("root.sg.d1", "s1")];

    struct Scenario {
        _dir: tempfile::TempDir,
        handle: PartitionHandle,
        sources: Vec<PathBuf>,
        target: PathBuf,
        log: PathBuf,
    }

    /// Two sequence sources and the temp target an inner compaction of them
    /// writes, logged up to `stage`
    fn scenario(stage: MergeStage) -> Scenario {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        let a = write_file(&handle, Lane::Sequence, TsFileName::new(1, 0), &D1, &[(1, 1), (2, 1)]);
        let b = write_file(&handle, Lane::Sequence, TsFileName::new(2, 0), &D1, &[(3, 1), (4, 1)]);
        let snapshot: Vec<(PathBuf, usize)> = [&a, &b]
            .iter()
            .map(|f| (handle.relative(f.path()).to_path_buf(), f.mods().len()))
            .collect();

        let merged = write_file(
            &handle,
            Lane::Sequence,
            TsFileName::new(2, 1),
            &D1,
            &[(1, 1), (2, 1), (3, 1), (4, 1)],
        );
        let target = merged.path().to_path_buf();
        drop(merged);
        std::fs::rename(&target, tsfile::merge_temp_path(&target)).unwrap();
        std::fs::remove_file(tsfile::resource_path(&target)).unwrap();

        let log = dir.path().join(log_file_name(&uuid::Uuid::new_v4()));
        let mut logger = MergeLogger::create(&log).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        logger
            .log(&MergeLogEntry::Task {
                kind: CompactionKind::InnerSpace {
                    lane: Lane::Sequence,
                },
                partition: handle.key.clone(),
            })
            .unwrap();
        logger
            .log_seq_files(snapshot.iter().map(|(p, _)| p.clone()).collect())
            .unwrap();
        logger.log_unseq_files(Vec::new()).unwrap();
        logger
            .log(&MergeLogEntry::Targets(vec![handle
                .relative(&target)
                .to_path_buf()]))
            .unwrap();
        logger.log(&MergeLogEntry::ModsSnapshot(snapshot)).unwrap();
        if stage != MergeStage::NotStarted {
            logger.log_merge_start().unwrap();
            logger.log_series_start(&key).unwrap();
        }
        if stage == MergeStage::Complete {
            logger
                .log_file_position(handle.relative(&target).to_path_buf(), 64)
                .unwrap();
            logger.log_series_end(&key).unwrap();
            logger.log_all_series_end().unwrap();
        }
        drop(logger);

        // arrives while the merge runs
        a.append_deletion(Deletion::new(key, TimeRange::new(2, 3)))
            .unwrap();

        Scenario {
            sources: vec![a.path().to_path_buf(), b.path().to_path_buf()],
            _dir: dir,
            handle,
            target,
            log,
        }
    }

    fn read_times(path: &Path) -> Vec<i64> {
        let resource = Arc::new(TsFileResource::load(path, Lane::Sequence).unwrap());
        let mut reader = FileSeriesReader::new(
            resource,
            &SeriesKey::new("root.sg.d1", "s1"),
            TimeRange::all(),
        );
        let mut times = Vec::new();
        while let Some(point) = reader.next().unwrap() {
            times.push(point.timestamp);
        }
        times
    }

    fn assert_discarded(s: &Scenario) {
        assert!(!tsfile::merge_temp_path(&s.target).exists());
        assert!(!s.target.exists());
        assert!(!s.log.exists());
        for source in &s.sources {
            assert!(source.exists());
        }
        assert_eq!(read_times(&s.sources[0]), vec![1]);
    }

    #[test]
    fn test_not_started_is_discarded() {
        let s = scenario(MergeStage::NotStarted);
        let stage = MergeRecoverTask::new(&s.log, &s.handle.dir).recover().unwrap();
        assert_eq!(stage, MergeStage::NotStarted);
        assert_discarded(&s);
    }

    #[test]
    fn test_partial_is_discarded() {
        let s = scenario(MergeStage::Partial);
        let stage = MergeRecoverTask::new(&s.log, &s.handle.dir).recover().unwrap();
        assert_eq!(stage, MergeStage::Partial);
        assert_discarded(&s);
    }

    #[test]
    fn test_complete_finishes_swap() {
        let s = scenario(MergeStage::Complete);
        let stage = MergeRecoverTask::new(&s.log, &s.handle.dir).recover().unwrap();
        assert_eq!(stage, MergeStage::Complete);

        assert!(s.target.exists());
        assert!(!tsfile::merge_temp_path(&s.target).exists());
        assert!(!s.log.exists());
        for source in &s.sources {
            assert!(!source.exists());
            assert!(!tsfile::resource_path(source).exists());
            assert!(!tsfile::mods_path(source).exists());
        }
        // the late deletion now applies to the target
        assert_eq!(read_times(&s.target), vec![1, 4]);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let s = scenario(MergeStage::Complete);
        let log_copy = std::fs::read(&s.log).unwrap();

        MergeRecoverTask::new(&s.log, &s.handle.dir).recover().unwrap();
        let target_mods = std::fs::read(tsfile::mods_path(&s.target)).unwrap();

        // crash before the log was removed: the same log is replayed
        std::fs::write(&s.log, &log_copy).unwrap();
        assert_eq!(recover_partition(&s.handle.dir).unwrap(), 1);
        assert_eq!(std::fs::read(tsfile::mods_path(&s.target)).unwrap(), target_mods);
        assert_eq!(read_times(&s.target), vec![1, 4]);

        assert_eq!(recover_partition(&s.handle.dir).unwrap(), 0);
        assert_eq!(read_times(&s.target), vec![1, 4]);
    }

    #[test]
    fn test_orphan_targets_are_swept() {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        let orphan =
            tsfile::merge_temp_path(&handle.lane_dir(Lane::Unsequence).join(TsFileName::new(7, 1).file_name()));
        std::fs::write(&orphan, b"partial").unwrap();
        let kept = write_file(&handle, Lane::Unsequence, TsFileName::new(7, 0), &D1, &[(1, 1)]);

        assert_eq!(recover_partition(dir.path()).unwrap(), 0);
        assert!(!orphan.exists());
        assert!(kept.path().exists());
    }
}
