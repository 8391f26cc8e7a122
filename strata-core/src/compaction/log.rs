//! Merge log
//!
//! One log per compaction task, written into the partition directory. Every
//! entry is framed, flushed and synced before the step it announces begins,
//! so after a crash the log alone tells whether the task never started,
//! stopped halfway through writing targets, or finished writing them.

use super::{CompactionKind, PartitionKey};
use crate::frame;
use crate::{Result, SeriesKey, StrataError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prefix of merge log file names
pub const LOG_PREFIX: &str = "compaction-";

/// Extension of merge log file names
pub const LOG_EXTENSION: &str = "log";

/// One step of a compaction.
///
/// File paths are relative to the partition directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeLogEntry {
    Task {
        kind: CompactionKind,
        partition: PartitionKey,
    },
    SeqFiles(Vec<PathBuf>),
    UnseqFiles(Vec<PathBuf>),
    /// Final names of the targets; data is written to `<name>.merge` first
    Targets(Vec<PathBuf>),
    /// Number of deletions in each source's modification file at merge start
    ModsSnapshot(Vec<(PathBuf, usize)>),
    MergeStart,
    SeriesStart(SeriesKey),
    FilePosition { file: PathBuf, position: u64 },
    SeriesEnd(SeriesKey),
    AllSeriesEnd,
    MergeEnd,
}

/// Appends entries to a merge log
pub struct MergeLogger {
    path: PathBuf,
    file: BufWriter<File>,
}

impl MergeLogger {
    /// Create a new log; fails if one already exists at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and make it durable
    pub fn log(&mut self, entry: &MergeLogEntry) -> Result<()> {
        let record = frame::encode(entry)?;
        self.file.write_all(&record)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    pub fn log_seq_files(&mut self, files: Vec<PathBuf>) -> Result<()> {
        self.log(&MergeLogEntry::SeqFiles(files))
    }

    pub fn log_unseq_files(&mut self, files: Vec<PathBuf>) -> Result<()> {
        self.log(&MergeLogEntry::UnseqFiles(files))
    }

    pub fn log_merge_start(&mut self) -> Result<()> {
        self.log(&MergeLogEntry::MergeStart)
    }

    pub fn log_series_start(&mut self, series: &SeriesKey) -> Result<()> {
        self.log(&MergeLogEntry::SeriesStart(series.clone()))
    }

    pub fn log_file_position(&mut self, file: PathBuf, position: u64) -> Result<()> {
        self.log(&MergeLogEntry::FilePosition { file, position })
    }

    pub fn log_series_end(&mut self, series: &SeriesKey) -> Result<()> {
        self.log(&MergeLogEntry::SeriesEnd(series.clone()))
    }

    pub fn log_all_series_end(&mut self) -> Result<()> {
        self.log(&MergeLogEntry::AllSeriesEnd)
    }

    pub fn log_merge_end(&mut self) -> Result<()> {
        self.log(&MergeLogEntry::MergeEnd)
    }
}

/// How far a logged compaction got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    /// Merge start was never logged
    NotStarted,
    /// Targets were being written when the log ends
    Partial,
    /// Every target was written and synced
    Complete,
}

/// Parsed content of a merge log
#[derive(Debug, Clone)]
pub struct MergeLogAnalysis {
    pub kind: Option<CompactionKind>,
    pub partition: Option<PartitionKey>,
    pub seq_files: Vec<PathBuf>,
    pub unseq_files: Vec<PathBuf>,
    pub targets: Vec<PathBuf>,
    pub mods_snapshot: Vec<(PathBuf, usize)>,
    pub stage: MergeStage,
    /// Series whose start was logged without a matching end
    pub unfinished_series: Option<SeriesKey>,
    pub finished_series: usize,
    /// Whether the swap was logged as done
    pub merge_end: bool,
}

impl MergeLogAnalysis {
    /// Classify a log from its intact prefix
    pub fn analyze(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let scan = frame::read_all::<MergeLogEntry>(path)?;
        if scan.torn {
            warn!("Merge log {:?} has a torn tail after {} bytes", path, scan.valid_len);
        }

        let mut analysis = Self {
            kind: None,
            partition: None,
            seq_files: Vec::new(),
            unseq_files: Vec::new(),
            targets: Vec::new(),
            mods_snapshot: Vec::new(),
            stage: MergeStage::NotStarted,
            unfinished_series: None,
            finished_series: 0,
            merge_end: false,
        };

        for entry in scan.records {
            match entry {
                MergeLogEntry::Task { kind, partition } => {
                    analysis.kind = Some(kind);
                    analysis.partition = Some(partition);
                }
                MergeLogEntry::SeqFiles(files) => analysis.seq_files = files,
                MergeLogEntry::UnseqFiles(files) => analysis.unseq_files = files,
                MergeLogEntry::Targets(files) => analysis.targets = files,
                MergeLogEntry::ModsSnapshot(counts) => analysis.mods_snapshot = counts,
                MergeLogEntry::MergeStart => analysis.stage = MergeStage::Partial,
                MergeLogEntry::SeriesStart(series) => analysis.unfinished_series = Some(series),
                MergeLogEntry::FilePosition { .. } => {}
                MergeLogEntry::SeriesEnd(_) => {
                    analysis.unfinished_series = None;
                    analysis.finished_series += 1;
                }
                MergeLogEntry::AllSeriesEnd => analysis.stage = MergeStage::Complete,
                MergeLogEntry::MergeEnd => analysis.merge_end = true,
            }
        }

        if analysis.stage == MergeStage::Complete && analysis.targets.is_empty() {
            return Err(StrataError::MergeRecovery(format!(
                "{:?} is complete but records no targets",
                path
            )));
        }
        Ok(analysis)
    }
}

/// Removes a finished merge log once the last retired source is gone.
///
/// Every retired source of a task holds the same `Arc<RetiredLog>`, so the
/// log outlives the files it can still be used to clean up.
#[derive(Debug)]
pub struct RetiredLog {
    path: PathBuf,
}

impl RetiredLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RetiredLog {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed merge log {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove merge log {:?}: {}", self.path, e),
        }
    }
}

/// Merge logs of a partition directory, oldest first
pub fn find_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    if !dir.exists() {
        return Ok(logs);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(LOG_PREFIX))
            && path.extension().map_or(false, |e| e == LOG_EXTENSION);
        if is_log {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// Log name for a new task; names sort by creation time
pub fn log_file_name(task_id: &uuid::Uuid) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(
        "{}{:020}-{}.{}",
        LOG_PREFIX,
        nanos.max(0),
        task_id.simple(),
        LOG_EXTENSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lane;
    use tempfile::tempdir;

    fn header(logger: &mut MergeLogger) {
        logger
            .log(&MergeLogEntry::Task {
                kind: CompactionKind::InnerSpace {
                    lane: Lane::Unsequence,
                },
                partition: PartitionKey::new("root.sg", 0),
            })
            .unwrap();
        logger.log_seq_files(vec![]).unwrap();
        logger
            .log_unseq_files(vec![PathBuf::from("unsequence/1-0.tsfile")])
            .unwrap();
        logger
            .log(&MergeLogEntry::Targets(vec![PathBuf::from("unsequence/1-1.tsfile")]))
            .unwrap();
    }

    #[test]
    fn test_three_way_classification() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");

        let not_started = dir.path().join("a.log");
        let mut logger = MergeLogger::create(&not_started).unwrap();
        header(&mut logger);
        drop(logger);
        let analysis = MergeLogAnalysis::analyze(&not_started).unwrap();
        assert_eq!(analysis.stage, MergeStage::NotStarted);
        assert_eq!(analysis.unseq_files.len(), 1);

        let partial = dir.path().join("b.log");
        let mut logger = MergeLogger::create(&partial).unwrap();
        header(&mut logger);
        logger.log_merge_start().unwrap();
        logger.log_series_start(&key).unwrap();
        drop(logger);
        let analysis = MergeLogAnalysis::analyze(&partial).unwrap();
        assert_eq!(analysis.stage, MergeStage::Partial);
        assert_eq!(analysis.unfinished_series, Some(key.clone()));

        let complete = dir.path().join("c.log");
        let mut logger = MergeLogger::create(&complete).unwrap();
        header(&mut logger);
        logger.log_merge_start().unwrap();
        logger.log_series_start(&key).unwrap();
        logger
            .log_file_position(PathBuf::from("unsequence/1-1.tsfile"), 128)
            .unwrap();
        logger.log_series_end(&key).unwrap();
        logger.log_all_series_end().unwrap();
        drop(logger);
        let analysis = MergeLogAnalysis::analyze(&complete).unwrap();
        assert_eq!(analysis.stage, MergeStage::Complete);
        assert_eq!(analysis.finished_series, 1);
        assert!(!analysis.merge_end);
        assert!(matches!(
            analysis.kind,
            Some(CompactionKind::InnerSpace { lane: Lane::Unsequence })
        ));
    }

    #[test]
    fn test_retired_log_removed_on_last_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(log_file_name(&uuid::Uuid::new_v4()));
        std::fs::write(&path, b"").unwrap();
        assert_eq!(find_logs(dir.path()).unwrap(), vec![path.clone()]);

        let guard = std::sync::Arc::new(RetiredLog::new(&path));
        let second = std::sync::Arc::clone(&guard);
        drop(guard);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
    }
}
