//! WAL writer implementation

use super::{SyncPolicy, WalConfig, WalEntry};
use crate::frame;
use crate::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// WAL writer for appending entries of one working file
pub struct WalWriter {
    path: PathBuf,
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    bytes_written: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create (or continue) the log at `path`
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        Ok(Self {
            path,
            config,
            inner: Mutex::new(WalWriterInner {
                file: BufWriter::new(file),
                bytes_written,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, returning its offset in the log
    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        let serialized = frame::encode(entry)?;
        let mut inner = self.inner.lock();

        inner.file.write_all(&serialized)?;
        let offset = inner.bytes_written;
        inner.bytes_written += serialized.len() as u64;
        inner.writes_since_sync += 1;

        // Sync based on policy
        if self.should_sync(&inner) {
            inner.file.flush()?;
            inner.file.get_ref().sync_data()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
        }

        Ok(offset)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Bytes in the log
    pub fn size(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Remove the log once its contents are durable elsewhere
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        remove_log(&path)
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.flush();
    }
}

/// Remove a log file, tolerating its absence
pub(crate) fn remove_log(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SeriesKey, TsValue};
    use tempfile::TempDir;

    #[test]
    fn test_wal_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1-0.tsfile.wal");
        let writer = WalWriter::open(&path, WalConfig::default()).unwrap();

        let key = SeriesKey::new("root.sg.d1", "temperature");
        let entry = WalEntry::insert(&key, 1_000, &TsValue::Double(23.5));
        assert_eq!(writer.append(&entry).unwrap(), 0);
        let second = writer.append(&entry).unwrap();
        assert!(second > 0);
        assert_eq!(writer.size(), std::fs::metadata(&path).unwrap().len());

        writer.remove().unwrap();
        assert!(!path.exists());
    }
}
