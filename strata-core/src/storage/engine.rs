//! Storage engine - top-level coordinator

use super::flush::{FlushHandle, FlushListener, FlushManager};
use super::group::{GroupStats, StorageGroup};
use super::partition::TimePartition;
use super::StorageConfig;
use crate::compaction::{
    schedule_compaction, CompactionConfig, CompactionStats, CompactionTaskManager,
};
use crate::query::{Filter, PointReader, PriorityMergeReader, QueryContext};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeValuePair, Timestamp, TsValue};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Strata storage engine
pub struct StorageEngine {
    config: Arc<StorageConfig>,
    groups: RwLock<HashMap<String, Arc<StorageGroup>>>,
    flush: FlushManager,
    compaction: Arc<CompactionTaskManager>,
    compaction_config: Arc<RwLock<CompactionConfig>>,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Open the engine, recovering every storage group under the data directory
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let config = Arc::new(config);

        let compaction = Arc::new(CompactionTaskManager::new(
            config.compaction.concurrent_compaction_thread,
        )?);
        let compaction_config = Arc::new(RwLock::new(config.compaction.clone()));

        let listener: FlushListener = {
            let compaction = Arc::clone(&compaction);
            let compaction_config = Arc::clone(&compaction_config);
            Arc::new(move |partition: &Arc<TimePartition>| {
                let config = compaction_config.read().clone();
                let submitted = schedule_compaction(partition.handle(), &config, &compaction);
                if submitted > 0 {
                    debug!("{} compactions submitted after flush on {}", submitted, partition.key());
                }
            })
        };
        let flush = FlushManager::new(config.flush_thread_count, Some(listener))?;

        let engine = Self {
            config,
            groups: RwLock::new(HashMap::new()),
            flush,
            compaction,
            compaction_config,
            closed: AtomicBool::new(false),
        };
        engine.load_storage_groups()?;
        Ok(engine)
    }

    fn load_storage_groups(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            // Skip hidden directories
            if name.starts_with('.') {
                continue;
            }

            let group = StorageGroup::open(&name, &self.config.data_dir, Arc::clone(&self.config))?;
            self.groups.write().insert(name.clone(), Arc::new(group));
            info!("Loaded storage group: {}", name);
        }
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::Shutdown);
        }
        Ok(())
    }

    /// Get a storage group by name
    pub fn storage_group(&self, name: &str) -> Option<Arc<StorageGroup>> {
        self.groups.read().get(name).cloned()
    }

    /// Get or create a storage group
    pub fn get_or_create_storage_group(&self, name: &str) -> Result<Arc<StorageGroup>> {
        if let Some(group) = self.storage_group(name) {
            return Ok(group);
        }

        let mut groups = self.groups.write();
        if let Some(group) = groups.get(name) {
            return Ok(Arc::clone(group));
        }
        let group = Arc::new(StorageGroup::open(
            name,
            &self.config.data_dir,
            Arc::clone(&self.config),
        )?);
        groups.insert(name.to_string(), Arc::clone(&group));
        info!("Created storage group: {}", name);
        Ok(group)
    }

    /// List all storage groups
    pub fn list_storage_groups(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn require_group(&self, name: &str) -> Result<Arc<StorageGroup>> {
        self.storage_group(name)
            .ok_or_else(|| StrataError::StorageGroupNotFound(name.to_string()))
    }

    /// Write one point
    pub fn insert(
        &self,
        storage_group: &str,
        series: &SeriesKey,
        timestamp: Timestamp,
        value: TsValue,
    ) -> Result<()> {
        self.ensure_open()?;
        let group = self.get_or_create_storage_group(storage_group)?;
        let partition = group.get_or_create_partition(self.config.partition_of(timestamp))?;
        if let Some(frozen) = partition.insert(series, timestamp, value)? {
            // the handle is dropped, nobody waits on size-triggered flushes
            self.flush.submit(partition, frozen);
        }
        Ok(())
    }

    /// Delete an inclusive time range of one series
    pub fn delete(&self, storage_group: &str, series: &SeriesKey, range: TimeRange) -> Result<()> {
        self.ensure_open()?;
        let group = self.require_group(storage_group)?;
        for partition in group.partitions_in(&range) {
            partition.delete(series, range)?;
        }
        Ok(())
    }

    /// Freeze and flush the working files of one partition
    pub fn flush(&self, storage_group: &str, partition: i64) -> Result<FlushHandle> {
        self.ensure_open()?;
        let group = self.require_group(storage_group)?;
        let mut handle = FlushHandle::default();
        if let Some(partition) = group.partition(partition) {
            for file in partition.freeze() {
                handle.merge(self.flush.submit(Arc::clone(&partition), file));
            }
        }
        Ok(handle)
    }

    /// Freeze and flush every working file
    pub fn flush_all(&self) -> Result<FlushHandle> {
        self.ensure_open()?;
        Ok(self.flush_everything())
    }

    fn flush_everything(&self) -> FlushHandle {
        let mut handle = FlushHandle::default();
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in groups {
            for partition in group.partitions() {
                for file in partition.freeze() {
                    handle.merge(self.flush.submit(Arc::clone(&partition), file));
                }
            }
        }
        handle
    }

    /// Reader over one series across all partitions, in time order
    pub fn open_reader(
        &self,
        storage_group: &str,
        series: &SeriesKey,
        filter: Option<Filter>,
        context: &QueryContext,
    ) -> Result<SeriesReader> {
        let group = self.require_group(storage_group)?;
        let filter = filter.unwrap_or_default();
        let mut readers = VecDeque::new();
        for partition in group.partitions_in(&filter.scan_range()) {
            readers.push_back(partition.open_reader(series, filter.clone(), context)?);
        }
        Ok(SeriesReader { readers })
    }

    /// Read every point of one series matching `filter`
    pub fn query(
        &self,
        storage_group: &str,
        series: &SeriesKey,
        filter: Option<Filter>,
    ) -> Result<Vec<TimeValuePair>> {
        self.open_reader(storage_group, series, filter, &QueryContext::new())?
            .read_all()
    }

    /// Run one compaction scheduling cycle over every partition.
    ///
    /// Frozen files whose flush failed are resubmitted first.
    pub fn schedule_compaction(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let config = self.compaction_config.read().clone();
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        let mut submitted = 0;
        for group in groups {
            for partition in group.partitions() {
                for file in partition.take_failed_flushes() {
                    debug!("Retrying flush of {:?}", file.resource.path());
                    self.flush.submit(Arc::clone(&partition), file);
                }
                submitted += schedule_compaction(partition.handle(), &config, &self.compaction);
            }
        }
        if submitted > 0 {
            info!("Compaction cycle submitted {} tasks", submitted);
        }
        submitted
    }

    pub fn compaction_config(&self) -> CompactionConfig {
        self.compaction_config.read().clone()
    }

    /// Replace the compaction settings; the worker pool size is fixed at open
    pub fn update_compaction_config(&self, config: CompactionConfig) {
        if config.concurrent_compaction_thread
            > self.config.compaction.concurrent_compaction_thread
        {
            warn!(
                "Compaction concurrency {} exceeds the {} worker threads",
                config.concurrent_compaction_thread,
                self.config.compaction.concurrent_compaction_thread
            );
        }
        info!("Updated compaction settings: {:?}", config);
        *self.compaction_config.write() = config;
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.compaction.stats()
    }

    /// Block until no compaction is queued or running
    pub fn wait_for_compactions(&self, timeout: Duration) -> bool {
        self.compaction.wait_idle(timeout)
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let groups: Vec<GroupStats> = {
            let groups = self.groups.read();
            let mut stats: Vec<_> = groups.values().map(|g| g.stats()).collect();
            stats.sort_by(|a, b| a.name.cmp(&b.name));
            stats
        };
        let mut stats = EngineStats {
            storage_groups: groups.len(),
            partitions: 0,
            seq_files: 0,
            unseq_files: 0,
            memtable_bytes: 0,
            pending_flushes: self.flush.pending(),
            failed_flushes: 0,
            compaction: self.compaction.stats(),
            groups: Vec::new(),
        };
        for partition in groups.iter().flat_map(|g| g.partitions.iter()) {
            stats.partitions += 1;
            stats.seq_files += partition.seq_files;
            stats.unseq_files += partition.unseq_files;
            stats.memtable_bytes += partition.memtable_bytes;
            stats.failed_flushes += partition.failed_flushes;
        }
        stats.groups = groups;
        stats
    }

    /// Flush every working file, then drain flush and compaction workers
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down storage engine");
        let flushed = self.flush_everything().wait();
        self.flush.shutdown();
        self.compaction.shutdown();
        flushed.map(|files| {
            debug!("Flushed {} files on shutdown", files.len());
        })
    }
}

/// Storage engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub storage_groups: usize,
    pub partitions: usize,
    pub seq_files: usize,
    pub unseq_files: usize,
    pub memtable_bytes: usize,
    pub pending_flushes: usize,
    pub failed_flushes: usize,
    pub compaction: CompactionStats,
    pub groups: Vec<GroupStats>,
}

/// Points of one series across time partitions.
///
/// Partitions never overlap in time, so their readers are drained one after
/// the other.
pub struct SeriesReader {
    readers: VecDeque<PriorityMergeReader>,
}

impl SeriesReader {
    /// Drain every remaining point
    pub fn read_all(&mut self) -> Result<Vec<TimeValuePair>> {
        let mut points = Vec::new();
        while let Some(point) = self.next()? {
            points.push(point);
        }
        Ok(points)
    }
}

impl PointReader for SeriesReader {
    fn has_next(&mut self) -> Result<bool> {
        while let Some(front) = self.readers.front_mut() {
            if front.has_next()? {
                return Ok(true);
            }
            if let Some(mut exhausted) = self.readers.pop_front() {
                exhausted.close();
            }
        }
        Ok(false)
    }

    fn next(&mut self) -> Result<Option<TimeValuePair>> {
        if !self.has_next()? {
            return Ok(None);
        }
        match self.readers.front_mut() {
            Some(reader) => reader.next(),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        for reader in self.readers.iter_mut() {
            reader.close();
        }
        self.readers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> StorageEngine {
        StorageEngine::open(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            partition_interval: 1_000,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_storage_engine() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        let key = SeriesKey::new("root.sg.d1", "temperature");

        for i in 0..100 {
            engine
                .insert("root.sg", &key, i * 50, TsValue::Double(20.0 + i as f64))
                .unwrap();
        }
        assert_eq!(engine.list_storage_groups(), vec!["root.sg".to_string()]);

        let points = engine
            .query("root.sg", &key, Some(Filter::time_range(900, 1_100)))
            .unwrap();
        let times: Vec<_> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![900, 950, 1_000, 1_050, 1_100]);

        let stats = engine.stats();
        assert_eq!(stats.storage_groups, 1);
        assert_eq!(stats.partitions, 5);
        assert!(stats.memtable_bytes > 0);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_storage_group() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        let key = SeriesKey::new("root.sg.d1", "s1");
        assert!(matches!(
            engine.query("root.missing", &key, None),
            Err(StrataError::StorageGroupNotFound(_))
        ));
        assert!(engine.delete("root.missing", &key, TimeRange::all()).is_err());
    }

    #[test]
    fn test_shutdown_flushes_and_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let key = SeriesKey::new("root.sg.d1", "s1");
        {
            let engine = engine(&temp_dir);
            engine.insert("root.sg", &key, 5, TsValue::Int32(5)).unwrap();
            engine.shutdown().unwrap();
            engine.shutdown().unwrap();
            assert!(matches!(
                engine.insert("root.sg", &key, 6, TsValue::Int32(6)),
                Err(StrataError::Shutdown)
            ));
        }

        let engine = engine(&temp_dir);
        let stats = engine.stats();
        assert_eq!(stats.seq_files, 1);
        assert_eq!(stats.memtable_bytes, 0);
        assert_eq!(
            engine.query("root.sg", &key, None).unwrap(),
            vec![TimeValuePair::new(5, TsValue::Int32(5))]
        );
    }

    #[test]
    fn test_compaction_settings_are_mutable() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        let mut config = engine.compaction_config();
        assert!(config.enable_cross_space_compaction);

        config.enable_cross_space_compaction = false;
        config.target_compaction_file_size = 1024;
        engine.update_compaction_config(config);

        let updated = engine.compaction_config();
        assert!(!updated.enable_cross_space_compaction);
        assert_eq!(updated.target_compaction_file_size, 1024);
    }
}
