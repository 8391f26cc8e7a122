//! File resources
//!
//! A `TsFileResource` describes one data file of a partition: where it lives,
//! which devices it holds and over which time ranges, whether it is still
//! being written, whether a compaction has claimed it, and which deletions
//! have been recorded against it.

mod list;
mod modification;

pub use list::{ResourceListReadGuard, ResourceListWriteGuard, TsFileResourceList};
pub use modification::{Deletion, ModificationFile};

use crate::compaction::RetiredLog;
use crate::frame;
use crate::memtable::MemTable;
use crate::tsfile::{self, TsFileName, TsFileReader};
use crate::{Lane, Result, SeriesKey, StrataError, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sidecar content
#[derive(Debug, Serialize, Deserialize)]
struct ResourceMeta {
    file_size: u64,
    device_ranges: BTreeMap<String, TimeRange>,
}

enum ResourceState {
    /// Still receiving writes, or flushing; data lives in the memtable
    Open(Arc<MemTable>),
    Closed,
}

/// Metadata wrapper around one data file
pub struct TsFileResource {
    path: PathBuf,
    lane: Lane,
    name: TsFileName,
    device_ranges: RwLock<BTreeMap<String, TimeRange>>,
    state: RwLock<ResourceState>,
    /// Claimed by a compaction task
    merging: AtomicBool,
    /// Physically removed once the last reference is dropped
    deleted: AtomicBool,
    file_size: AtomicU64,
    mods: ModificationFile,
    reader: Mutex<Option<Arc<TsFileReader>>>,
    retired_log: Mutex<Option<Arc<RetiredLog>>>,
}

impl TsFileResource {
    /// Create the resource of a new working file backed by `memtable`
    pub fn open_new(path: impl AsRef<Path>, lane: Lane, memtable: Arc<MemTable>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = Self::parse_name(&path)?;
        let mods = ModificationFile::open(tsfile::mods_path(&path))?;

        Ok(Self {
            path,
            lane,
            name,
            device_ranges: RwLock::new(BTreeMap::new()),
            state: RwLock::new(ResourceState::Open(memtable)),
            merging: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            file_size: AtomicU64::new(0),
            mods,
            reader: Mutex::new(None),
            retired_log: Mutex::new(None),
        })
    }

    /// Create a closed resource for a freshly written file and persist its sidecar
    pub fn new_closed(
        path: impl AsRef<Path>,
        lane: Lane,
        device_ranges: BTreeMap<String, TimeRange>,
        file_size: u64,
    ) -> Result<Self> {
        let resource = Self::closed(path.as_ref(), lane, device_ranges, file_size)?;
        resource.serialize()?;
        Ok(resource)
    }

    fn closed(
        path: &Path,
        lane: Lane,
        device_ranges: BTreeMap<String, TimeRange>,
        file_size: u64,
    ) -> Result<Self> {
        let path = path.to_path_buf();
        Ok(Self {
            name: Self::parse_name(&path)?,
            mods: ModificationFile::open(tsfile::mods_path(&path))?,
            path,
            lane,
            device_ranges: RwLock::new(device_ranges),
            state: RwLock::new(ResourceState::Closed),
            merging: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            file_size: AtomicU64::new(file_size),
            reader: Mutex::new(None),
            retired_log: Mutex::new(None),
        })
    }

    /// Load a closed file from disk.
    ///
    /// Uses the sidecar when it is present and matches the file; otherwise
    /// the time ranges are rebuilt from the file index and the sidecar is
    /// rewritten.
    pub fn load(path: impl AsRef<Path>, lane: Lane) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let actual_size = std::fs::metadata(&path)?.len();

        match Self::read_sidecar(&path) {
            Some(meta) if meta.file_size == actual_size => {
                Self::closed(&path, lane, meta.device_ranges, meta.file_size)
            }
            stale => {
                if stale.is_some() {
                    info!("Sidecar of {:?} is stale, rebuilding", path);
                } else {
                    info!("Sidecar of {:?} is missing, rebuilding", path);
                }
                let reader = TsFileReader::open(&path)?;
                Self::new_closed(&path, lane, reader.device_time_ranges(), reader.file_size())
            }
        }
    }

    fn read_sidecar(path: &Path) -> Option<ResourceMeta> {
        let data = std::fs::read(tsfile::resource_path(path)).ok()?;
        match frame::decode::<ResourceMeta>(&data) {
            Ok(Some((meta, _))) => Some(meta),
            Ok(None) => None,
            Err(e) => {
                warn!("Unreadable sidecar for {:?}: {}", path, e);
                None
            }
        }
    }

    fn parse_name(path: &Path) -> Result<TsFileName> {
        TsFileName::parse(path).ok_or_else(|| {
            StrataError::InvalidFormat(format!("Not a data file name: {}", path.display()))
        })
    }

    /// Write the sidecar atomically (temp file + rename)
    pub fn serialize(&self) -> Result<()> {
        let meta = ResourceMeta {
            file_size: self.file_size(),
            device_ranges: self.device_ranges.read().clone(),
        };
        let record = frame::encode(&meta)?;

        let target = tsfile::resource_path(&self.path);
        let temp = tsfile::with_suffix(&target, ".tmp");
        {
            let mut file = std::fs::File::create(&temp)?;
            std::io::Write::write_all(&mut file, &record)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Widen the range of a device; only valid while the file is open
    pub fn update_time(&self, device: &str, timestamp: Timestamp) {
        if self.is_closed() {
            debug!("Ignoring time update on closed {:?}", self.path);
            return;
        }
        let mut ranges = self.device_ranges.write();
        match ranges.get_mut(device) {
            Some(range) => range.extend(timestamp),
            None => {
                ranges.insert(device.to_string(), TimeRange::point(timestamp));
            }
        }
    }

    /// Seal the file after its data has been written.
    ///
    /// The ranges of the written file replace the ranges widened while open.
    pub fn close(&self, device_ranges: BTreeMap<String, TimeRange>, file_size: u64) -> Result<()> {
        *self.device_ranges.write() = device_ranges;
        self.file_size.store(file_size, Ordering::Release);
        self.serialize()?;
        *self.state.write() = ResourceState::Closed;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Monotonic version within the partition; newer files have larger versions
    pub fn version(&self) -> u64 {
        self.name.version
    }

    /// Number of compactions the data went through
    pub fn level(&self) -> u32 {
        self.name.level
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Memtable backing the file while it is open
    pub fn memtable(&self) -> Option<Arc<MemTable>> {
        match &*self.state.read() {
            ResourceState::Open(memtable) => Some(Arc::clone(memtable)),
            ResourceState::Closed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.read(), ResourceState::Closed)
    }

    /// Only selectors (under the list lock) and task finalisers call this
    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn device_ranges(&self) -> BTreeMap<String, TimeRange> {
        self.device_ranges.read().clone()
    }

    pub fn devices(&self) -> Vec<String> {
        self.device_ranges.read().keys().cloned().collect()
    }

    pub fn time_range(&self, device: &str) -> Option<TimeRange> {
        self.device_ranges.read().get(device).copied()
    }

    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        self.time_range(device).map(|r| r.start)
    }

    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        self.time_range(device).map(|r| r.end)
    }

    /// Check if data of `device` may fall inside `range`
    pub fn overlaps(&self, device: &str, range: &TimeRange) -> bool {
        self.time_range(device).map_or(false, |r| r.overlaps(range))
    }

    /// Latest end time over all devices
    pub fn max_end_time(&self) -> Option<Timestamp> {
        self.device_ranges.read().values().map(|r| r.end).max()
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.device_ranges.read().contains_key(device)
    }

    /// Check if every device of the file ended before `bound`
    pub fn ends_before(&self, bound: Timestamp) -> bool {
        self.device_ranges.read().values().all(|r| r.end < bound)
    }

    /// Shared reader, opened on first use
    pub fn reader(&self) -> Result<Arc<TsFileReader>> {
        if !self.is_closed() {
            return Err(StrataError::Internal(format!(
                "{:?} is still open",
                self.path
            )));
        }
        let mut cached = self.reader.lock();
        if let Some(reader) = cached.as_ref() {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(TsFileReader::open(&self.path)?);
        *cached = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Drop the cached reader; holders of the `Arc` keep theirs
    pub fn release_reader(&self) {
        self.reader.lock().take();
    }

    pub fn mods(&self) -> &ModificationFile {
        &self.mods
    }

    /// Deleted ranges of one series
    pub fn deletions_for(&self, series: &SeriesKey) -> Vec<TimeRange> {
        self.mods.ranges_for(series)
    }

    /// Record a deletion in the modification file
    pub fn append_deletion(&self, deletion: Deletion) -> Result<()> {
        self.mods.append(deletion)
    }

    /// Schedule physical removal once the last reference is dropped
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Retire a compaction source; the merge log outlives the file
    pub fn retire(&self, log: Arc<RetiredLog>) {
        *self.retired_log.lock() = Some(log);
        self.mark_deleted();
    }
}

impl Drop for TsFileResource {
    fn drop(&mut self) {
        if !self.is_deleted() {
            return;
        }
        self.reader.get_mut().take();

        for path in [self.path.clone(), tsfile::resource_path(&self.path)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
        if let Err(e) = self.mods.remove() {
            warn!("Failed to remove {:?}: {}", self.mods.path(), e);
        }
        debug!("Removed retired file {:?}", self.path);
    }
}

impl std::fmt::Debug for TsFileResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsFileResource")
            .field("path", &self.path)
            .field("lane", &self.lane)
            .field("closed", &self.is_closed())
            .field("merging", &self.is_merging())
            .field("file_size", &self.file_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsfile::{TsFileConfig, TsFileWriter};
    use crate::{DataType, TimeValuePair};
    use tempfile::tempdir;

    fn write_file(path: &Path, device: &str, range: std::ops::Range<i64>) -> tsfile::TsFileSummary {
        let mut writer = TsFileWriter::create(path, TsFileConfig::default()).unwrap();
        writer
            .write_series(
                &SeriesKey::new(device, "s1"),
                DataType::Int64,
                range.map(|t| TimeValuePair::new(t, t)),
            )
            .unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_open_resource_widens_until_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TsFileName::new(1, 0).file_name());
        let resource =
            TsFileResource::open_new(&path, Lane::Sequence, Arc::new(MemTable::new(1))).unwrap();

        resource.update_time("root.sg.d1", 50);
        resource.update_time("root.sg.d1", 10);
        assert_eq!(resource.time_range("root.sg.d1"), Some(TimeRange::new(10, 50)));
        assert!(!resource.is_closed());
        assert!(resource.memtable().is_some());
        assert!(resource.reader().is_err());

        let summary = write_file(&path, "root.sg.d1", 10..51);
        resource.close(summary.device_ranges, summary.file_size).unwrap();
        assert!(resource.is_closed());

        resource.update_time("root.sg.d1", 1_000);
        assert_eq!(resource.end_time("root.sg.d1"), Some(50));
        assert!(tsfile::resource_path(&path).exists());
    }

    #[test]
    fn test_load_rebuilds_missing_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TsFileName::new(7, 2).file_name());
        write_file(&path, "root.sg.d2", 100..200);

        let resource = TsFileResource::load(&path, Lane::Unsequence).unwrap();
        assert_eq!(resource.version(), 7);
        assert_eq!(resource.level(), 2);
        assert_eq!(resource.time_range("root.sg.d2"), Some(TimeRange::new(100, 199)));
        assert!(tsfile::resource_path(&path).exists());

        // the rewritten sidecar is used on the next load
        let reloaded = TsFileResource::load(&path, Lane::Unsequence).unwrap();
        assert_eq!(reloaded.device_ranges(), resource.device_ranges());
    }

    #[cfg(unix)]
    #[test]
    fn test_load_keeps_valid_sidecar() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join(TsFileName::new(4, 0).file_name());
        write_file(&path, "root.sg.d1", 0..10);
        TsFileResource::load(&path, Lane::Sequence).unwrap();

        // a rewrite renames a new file over the sidecar
        let sidecar = tsfile::resource_path(&path);
        let inode = std::fs::metadata(&sidecar).unwrap().ino();
        let resource = TsFileResource::load(&path, Lane::Sequence).unwrap();
        assert_eq!(resource.time_range("root.sg.d1"), Some(TimeRange::new(0, 9)));
        assert_eq!(std::fs::metadata(&sidecar).unwrap().ino(), inode);
    }

    #[test]
    fn test_deferred_deletion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TsFileName::new(3, 0).file_name());
        let summary = write_file(&path, "root.sg.d1", 0..10);
        let resource = Arc::new(
            TsFileResource::new_closed(&path, Lane::Sequence, summary.device_ranges, summary.file_size)
                .unwrap(),
        );
        resource
            .append_deletion(Deletion::new(SeriesKey::new("root.sg.d1", "s1"), TimeRange::new(0, 1)))
            .unwrap();

        let pinned = Arc::clone(&resource);
        let reader = pinned.reader().unwrap();
        resource.mark_deleted();
        drop(resource);
        assert!(path.exists());

        assert_eq!(reader.read_series(&SeriesKey::new("root.sg.d1", "s1")).unwrap().len(), 10);
        drop(pinned);
        assert!(!path.exists());
        assert!(!tsfile::resource_path(&path).exists());
        assert!(!tsfile::mods_path(&path).exists());
    }
}
