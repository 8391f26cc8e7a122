//! One time partition of a storage group

use super::flush::write_memtable;
use super::StorageConfig;
use crate::compaction::{recover_partition, PartitionHandle, PartitionKey};
use crate::memtable::MemTable;
use crate::query::{Filter, PriorityMergeReader, QueryContext, QueryDataSource};
use crate::resource::{Deletion, TsFileResource, TsFileResourceList};
use crate::tsfile::{self, TsFileName, TsFileSummary, WAL_SUFFIX};
use crate::wal::{WalEntry, WalReader, WalWriter};
use crate::{Lane, Result, SeriesKey, StrataError, TimeRange, Timestamp, TsValue};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An open file receiving writes
pub(crate) struct WorkingFile {
    pub(crate) resource: Arc<TsFileResource>,
    pub(crate) memtable: Arc<MemTable>,
    pub(crate) wal: Option<WalWriter>,
}

#[derive(Default)]
struct Working {
    seq: Option<WorkingFile>,
    unseq: Option<WorkingFile>,
}

impl Working {
    fn slot_mut(&mut self, lane: Lane) -> &mut Option<WorkingFile> {
        match lane {
            Lane::Sequence => &mut self.seq,
            Lane::Unsequence => &mut self.unseq,
        }
    }

    fn files(&self) -> impl Iterator<Item = &WorkingFile> {
        self.seq.iter().chain(self.unseq.iter())
    }

    fn holds(&self, resource: &Arc<TsFileResource>) -> bool {
        self.files().any(|f| Arc::ptr_eq(&f.resource, resource))
    }
}

/// Partition counters
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub partition: i64,
    pub seq_files: usize,
    pub unseq_files: usize,
    pub merging_files: usize,
    pub memtable_bytes: usize,
    pub failed_flushes: usize,
}

/// Files, working memtables and routing state of one time partition.
///
/// Lock order: working files, then the sequence list, then the unsequence
/// list.
pub struct TimePartition {
    handle: PartitionHandle,
    config: Arc<StorageConfig>,
    next_version: AtomicU64,
    /// Highest timestamp per device handed to the flusher from the sequence lane
    last_flushed: RwLock<HashMap<String, Timestamp>>,
    working: Mutex<Working>,
    /// Frozen files whose flush failed; taken again by the next flush
    failed: Mutex<Vec<WorkingFile>>,
}

impl TimePartition {
    /// Open a partition directory, recovering compactions, files and logs
    pub fn open(
        storage_group: &str,
        partition: i64,
        dir: impl AsRef<Path>,
        config: Arc<StorageConfig>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        for lane in [Lane::Sequence, Lane::Unsequence] {
            std::fs::create_dir_all(dir.join(lane.dir_name()))?;
        }

        let recovered_logs = recover_partition(&dir)?;
        if recovered_logs > 0 {
            info!(
                "Recovered {} interrupted compactions in {:?}",
                recovered_logs, dir
            );
        }

        let handle = PartitionHandle {
            key: PartitionKey::new(storage_group, partition),
            dir,
            seq: Arc::new(TsFileResourceList::new(Lane::Sequence)),
            unseq: Arc::new(TsFileResourceList::new(Lane::Unsequence)),
            tsfile_config: config.tsfile.clone(),
        };
        let partition = Self {
            handle,
            config,
            next_version: AtomicU64::new(1),
            last_flushed: RwLock::new(HashMap::new()),
            working: Mutex::new(Working::default()),
            failed: Mutex::new(Vec::new()),
        };
        partition.load()?;
        Ok(partition)
    }

    fn load(&self) -> Result<()> {
        let mut max_version = 0;
        for lane in [Lane::Sequence, Lane::Unsequence] {
            let resources = self.load_lane(lane)?;
            let mut list = self.handle.list(lane).write();
            for resource in resources {
                max_version = max_version.max(resource.version());
                list.insert(resource);
            }
        }
        self.next_version.store(max_version + 1, Ordering::SeqCst);

        let mut last_flushed = self.last_flushed.write();
        for resource in self.handle.seq.snapshot() {
            for (device, range) in resource.device_ranges() {
                let entry = last_flushed.entry(device).or_insert(range.end);
                *entry = (*entry).max(range.end);
            }
        }
        debug!(
            "Opened partition {}: {} seq, {} unseq files",
            self.handle.key,
            self.handle.seq.len(),
            self.handle.unseq.len()
        );
        Ok(())
    }

    fn load_lane(&self, lane: Lane) -> Result<Vec<Arc<TsFileResource>>> {
        let dir = self.handle.lane_dir(lane);
        let mut data_files = Vec::new();
        let mut wals = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if tsfile::is_tsfile(&path) {
                data_files.push(path);
            } else if name.ends_with(WAL_SUFFIX) {
                wals.push(path);
            }
        }
        data_files.sort();
        wals.sort();

        let mut resources = Vec::with_capacity(data_files.len());
        for path in data_files {
            let wal = tsfile::wal_path(&path);
            match TsFileResource::load(&path, lane) {
                Ok(resource) => {
                    // the flush finished, only removing the log was cut short
                    if wal.exists() {
                        std::fs::remove_file(&wal)?;
                    }
                    resources.push(Arc::new(resource));
                }
                Err(e) if wal.exists() => {
                    warn!("Discarding incomplete {:?} ({}), replaying its log", path, e);
                    std::fs::remove_file(&path)?;
                    remove_if_exists(&tsfile::resource_path(&path))?;
                }
                Err(e) => warn!("Skipping unreadable data file {:?}: {}", path, e),
            }
        }

        for wal in wals {
            if !wal.exists() {
                continue;
            }
            if let Some(resource) = self.replay_wal(&wal, lane)? {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    /// Rebuild a file that was still being written from its log
    fn replay_wal(&self, wal: &Path, lane: Lane) -> Result<Option<Arc<TsFileResource>>> {
        let data_path = wal
            .to_str()
            .and_then(|p| p.strip_suffix(WAL_SUFFIX))
            .map(PathBuf::from)
            .ok_or_else(|| StrataError::WalRecovery(format!("Bad log name {:?}", wal)))?;
        let name = TsFileName::parse(&data_path)
            .ok_or_else(|| StrataError::WalRecovery(format!("Bad log name {:?}", wal)))?;

        let memtable = MemTable::new(name.version);
        let applied = WalReader::new(wal).replay_into(&memtable)?;
        if memtable.is_empty() {
            info!("Log {:?} holds no live points, removing it", wal);
            std::fs::remove_file(wal)?;
            return Ok(None);
        }

        let summary = write_memtable(&data_path, &memtable, &self.config.tsfile)?;
        let resource =
            TsFileResource::new_closed(&data_path, lane, summary.device_ranges, summary.file_size)?;
        std::fs::remove_file(wal)?;
        info!(
            "Replayed {} log entries into {:?} ({} points)",
            applied, data_path, summary.point_count
        );
        Ok(Some(Arc::new(resource)))
    }

    pub fn key(&self) -> &PartitionKey {
        &self.handle.key
    }

    pub fn handle(&self) -> &PartitionHandle {
        &self.handle
    }

    pub fn dir(&self) -> &Path {
        &self.handle.dir
    }

    /// Inclusive time range covered by the partition
    pub fn time_range(&self) -> TimeRange {
        let interval = self.config.partition_interval;
        let start = self.handle.key.partition.saturating_mul(interval);
        TimeRange::new(start, start.saturating_add(interval - 1))
    }

    pub fn last_flushed_time(&self, device: &str) -> Option<Timestamp> {
        self.last_flushed.read().get(device).copied()
    }

    /// Write one point; returns the frozen file when its memtable is full
    pub(crate) fn insert(
        &self,
        series: &SeriesKey,
        timestamp: Timestamp,
        value: TsValue,
    ) -> Result<Option<WorkingFile>> {
        let mut working = self.working.lock();
        let lane = match self.last_flushed_time(&series.device) {
            Some(last) if timestamp <= last => Lane::Unsequence,
            _ => Lane::Sequence,
        };

        let slot = working.slot_mut(lane);
        if slot.is_none() {
            *slot = Some(self.create_working(lane)?);
        }
        let Some(file) = slot.as_ref() else {
            return Err(StrataError::Internal("no working file".into()));
        };

        if let Some(chunk) = file.memtable.chunk(series) {
            if chunk.data_type() != value.data_type() {
                return Err(StrataError::TypeMismatch {
                    series: series.canonical(),
                    expected: chunk.data_type().to_string(),
                    actual: value.data_type().to_string(),
                });
            }
        }
        if let Some(wal) = &file.wal {
            wal.append(&WalEntry::insert(series, timestamp, &value))?;
        }
        file.memtable.insert(series, timestamp, value)?;
        file.resource.update_time(&series.device, timestamp);

        if file.memtable.should_flush(self.config.memtable_size_limit) {
            return Ok(self.freeze_lane(&mut working, lane));
        }
        Ok(None)
    }

    fn create_working(&self, lane: Lane) -> Result<WorkingFile> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let path = self
            .handle
            .lane_dir(lane)
            .join(TsFileName::new(version, 0).file_name());

        let memtable = Arc::new(MemTable::new(version));
        let wal = if self.config.wal.enabled {
            Some(WalWriter::open(tsfile::wal_path(&path), self.config.wal.clone())?)
        } else {
            None
        };
        let resource = Arc::new(TsFileResource::open_new(&path, lane, Arc::clone(&memtable))?);
        self.handle.list(lane).insert(Arc::clone(&resource));
        debug!("{} opened working file {:?}", self.handle.key, path);

        Ok(WorkingFile {
            resource,
            memtable,
            wal,
        })
    }

    fn freeze_lane(&self, working: &mut Working, lane: Lane) -> Option<WorkingFile> {
        let file = working.slot_mut(lane).take()?;
        file.memtable.freeze();
        if lane == Lane::Sequence {
            let mut last_flushed = self.last_flushed.write();
            for (device, range) in file.memtable.device_time_ranges() {
                let entry = last_flushed.entry(device).or_insert(range.end);
                *entry = (*entry).max(range.end);
            }
        }
        Some(file)
    }

    /// Freeze both working files, plus any whose earlier flush failed; they
    /// stay readable until flushed
    pub(crate) fn freeze(&self) -> Vec<WorkingFile> {
        let mut files = self.take_failed_flushes();
        let mut working = self.working.lock();
        files.extend(
            [Lane::Sequence, Lane::Unsequence]
                .into_iter()
                .filter_map(|lane| self.freeze_lane(&mut working, lane)),
        );
        files
    }

    pub(crate) fn take_failed_flushes(&self) -> Vec<WorkingFile> {
        std::mem::take(&mut *self.failed.lock())
    }

    /// Write a frozen memtable to its file and seal the resource.
    ///
    /// On failure the file is kept for the next flush; its memtable stays
    /// readable and its log stays on disk.
    pub(crate) fn flush_file(&self, file: WorkingFile) -> Result<Option<Arc<TsFileResource>>> {
        let summary = match self.seal(&file) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    "{} could not flush {:?}, retrying later: {}",
                    self.handle.key,
                    file.resource.path(),
                    e
                );
                self.failed.lock().push(file);
                return Err(e);
            }
        };

        let WorkingFile {
            resource,
            memtable,
            wal,
        } = file;
        if let Some(wal) = wal {
            wal.remove()?;
        }
        let Some(summary) = summary else {
            return Ok(None);
        };
        info!(
            "{} flushed memtable {} to {:?}: {} points, {} bytes",
            self.handle.key,
            memtable.id(),
            resource.path(),
            summary.point_count,
            summary.file_size
        );
        Ok(Some(resource))
    }

    fn seal(&self, file: &WorkingFile) -> Result<Option<TsFileSummary>> {
        let resource = &file.resource;
        let summary = write_memtable(resource.path(), &file.memtable, &self.config.tsfile)?;

        if summary.series_count == 0 {
            // everything was deleted before the flush
            self.handle.list(resource.lane()).remove(resource);
            resource.mark_deleted();
            return Ok(None);
        }
        resource.close(summary.device_ranges.clone(), summary.file_size)?;
        Ok(Some(summary))
    }

    /// Delete `range` of a series from every source that may hold it.
    ///
    /// Both lists stay read-locked for the whole call so a compaction swap
    /// either sees the deletion on its sources or runs after it.
    pub fn delete(&self, series: &SeriesKey, range: TimeRange) -> Result<()> {
        let working = self.working.lock();
        let seq = self.handle.seq.read();
        let unseq = self.handle.unseq.read();

        for file in working.files() {
            if let Some(wal) = &file.wal {
                wal.append(&WalEntry::delete(series, range))?;
            }
            file.memtable.delete(series, &range);
        }

        let deletion = Deletion::new(series.clone(), range);
        for resource in seq.iter().chain(unseq.iter()) {
            if working.holds(resource) || !resource.overlaps(&series.device, &range) {
                continue;
            }
            resource.append_deletion(deletion.clone())?;
        }
        Ok(())
    }

    /// Merged reader over every source of `series` as of now
    pub fn open_reader(
        &self,
        series: &SeriesKey,
        filter: Filter,
        context: &QueryContext,
    ) -> Result<PriorityMergeReader> {
        QueryDataSource::capture(series, filter.scan_range(), &self.handle.seq, &self.handle.unseq)
            .into_reader(filter, context)
    }

    pub fn stats(&self) -> PartitionStats {
        let working = self.working.lock();
        let seq = self.handle.seq.read();
        let unseq = self.handle.unseq.read();
        PartitionStats {
            partition: self.handle.key.partition,
            seq_files: seq.len(),
            unseq_files: unseq.len(),
            merging_files: seq
                .iter()
                .chain(unseq.iter())
                .filter(|f| f.is_merging())
                .count(),
            memtable_bytes: working.files().map(|f| f.memtable.size()).sum(),
            failed_flushes: self.failed.lock().len(),
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> Arc<StorageConfig> {
        Arc::new(StorageConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    fn read(partition: &TimePartition, series: &SeriesKey) -> Vec<(i64, TsValue)> {
        partition
            .open_reader(series, Filter::default(), &QueryContext::new())
            .unwrap()
            .read_all()
            .unwrap()
            .into_iter()
            .map(|p| (p.timestamp, p.value))
            .collect()
    }

    #[test]
    fn test_routing_follows_last_flushed_time() {
        let dir = tempdir().unwrap();
        let partition = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");

        for t in [10, 20, 30] {
            assert!(partition.insert(&key, t, TsValue::Int64(t)).unwrap().is_none());
        }
        for file in partition.freeze() {
            partition.flush_file(file).unwrap();
        }
        assert_eq!(partition.last_flushed_time("root.sg.d1"), Some(30));

        partition.insert(&key, 25, TsValue::Int64(-25)).unwrap();
        partition.insert(&key, 40, TsValue::Int64(40)).unwrap();
        // another device has no history and goes to the sequence lane
        partition
            .insert(&SeriesKey::new("root.sg.d2", "s1"), 5, TsValue::Int64(5))
            .unwrap();

        assert_eq!(partition.handle().seq.len(), 2);
        assert_eq!(partition.handle().unseq.len(), 1);
        assert_eq!(
            read(&partition, &key),
            vec![
                (10, TsValue::Int64(10)),
                (20, TsValue::Int64(20)),
                (25, TsValue::Int64(-25)),
                (30, TsValue::Int64(30)),
                (40, TsValue::Int64(40)),
            ]
        );
    }

    #[test]
    fn test_last_write_wins_while_sequence_lane_flushes() {
        let dir = tempdir().unwrap();
        let config = Arc::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            memtable_size_limit: 1_000,
            ..Default::default()
        });
        let partition = TimePartition::open("root.sg", 0, dir.path(), config).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let at_100 = |partition: &TimePartition| {
            read(partition, &key)
                .into_iter()
                .find(|(t, _)| *t == 100)
                .map(|(_, v)| v)
        };

        partition.insert(&key, 10, TsValue::Int64(0)).unwrap();
        for file in partition.freeze() {
            partition.flush_file(file).unwrap();
        }
        // unsequence memtable opened before the next sequence one
        partition.insert(&key, 5, TsValue::Int64(0)).unwrap();
        partition.insert(&key, 100, TsValue::Int64(1)).unwrap();

        // a large value fills the sequence memtable alone
        let frozen = partition
            .insert(
                &SeriesKey::new("root.sg.d1", "s2"),
                200,
                TsValue::Text("x".repeat(2_000)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(frozen.resource.lane(), Lane::Sequence);

        // the overwrite is routed to the older unsequence memtable
        partition.insert(&key, 100, TsValue::Int64(2)).unwrap();
        assert_eq!(at_100(&partition), Some(TsValue::Int64(2)));

        partition.flush_file(frozen).unwrap();
        assert_eq!(at_100(&partition), Some(TsValue::Int64(2)));
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let dir = tempdir().unwrap();
        let partition = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        for t in 0..10 {
            partition.insert(&key, t, TsValue::Int64(t)).unwrap();
        }

        let mut files = partition.freeze();
        let file = files.pop().unwrap();
        let path = file.resource.path().to_path_buf();
        // a directory in the way makes writing the data file fail
        std::fs::create_dir(&path).unwrap();
        assert!(partition.flush_file(file).is_err());

        assert_eq!(partition.stats().failed_flushes, 1);
        assert!(tsfile::wal_path(&path).exists());
        assert_eq!(read(&partition, &key).len(), 10);

        std::fs::remove_dir(&path).unwrap();
        let retried = partition.freeze();
        assert_eq!(retried.len(), 1);
        for file in retried {
            let sealed = partition.flush_file(file).unwrap().unwrap();
            assert!(sealed.is_closed());
        }
        assert_eq!(partition.stats().failed_flushes, 0);
        assert!(!tsfile::wal_path(&path).exists());
        assert_eq!(read(&partition, &key).len(), 10);
    }

    #[test]
    fn test_type_mismatch_is_rejected_before_logging() {
        let dir = tempdir().unwrap();
        let partition = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");

        partition.insert(&key, 1, TsValue::Int64(1)).unwrap();
        let result = partition.insert(&key, 2, TsValue::Double(2.0));
        assert!(matches!(result, Err(StrataError::TypeMismatch { .. })));

        drop(partition);
        let reopened = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        assert_eq!(read(&reopened, &key), vec![(1, TsValue::Int64(1))]);
    }

    #[test]
    fn test_fully_deleted_memtable_leaves_no_file() {
        let dir = tempdir().unwrap();
        let partition = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");

        partition.insert(&key, 1, TsValue::Int64(1)).unwrap();
        partition.delete(&key, TimeRange::all()).unwrap();
        let files = partition.freeze();
        let path = files[0].resource.path().to_path_buf();
        for file in files {
            assert!(partition.flush_file(file).unwrap().is_none());
        }

        assert!(partition.handle().seq.is_empty());
        assert!(!path.exists());
        assert!(!tsfile::wal_path(&path).exists());
    }

    #[test]
    fn test_incomplete_flush_is_rebuilt_from_log() {
        let dir = tempdir().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        let path = {
            let partition =
                TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
            for t in 0..10 {
                partition.insert(&key, t, TsValue::Int64(t)).unwrap();
            }
            partition.delete(&key, TimeRange::new(3, 4)).unwrap();
            let working = partition.working.lock();
            let path = working.seq.as_ref().unwrap().resource.path().to_path_buf();
            path
        };
        // crash while the data file was half written
        std::fs::write(&path, b"STSF\x01").unwrap();

        let partition = TimePartition::open("root.sg", 0, dir.path(), config(dir.path())).unwrap();
        assert!(!tsfile::wal_path(&path).exists());
        assert_eq!(partition.handle().seq.len(), 1);
        let times: Vec<_> = read(&partition, &key).into_iter().map(|(t, _)| t).collect();
        assert_eq!(times, vec![0, 1, 2, 5, 6, 7, 8, 9]);
        assert_eq!(partition.last_flushed_time("root.sg.d1"), Some(9));

        // new files never reuse a recovered version
        partition.insert(&key, 100, TsValue::Int64(0)).unwrap();
        let versions: Vec<_> = partition.handle().seq.snapshot().iter().map(|f| f.version()).collect();
        assert_eq!(versions, vec![1, 2]);
    }
}
