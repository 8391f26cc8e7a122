//! Modification files
//!
//! Deletions against a file that is no longer written to are recorded next to
//! it instead of rewriting the data. Readers subtract them per source; a
//! compaction applies them physically.

use crate::frame;
use crate::{Result, SeriesKey, TimeRange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A logical deletion of one series over an inclusive time range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub series: SeriesKey,
    pub range: TimeRange,
}

impl Deletion {
    pub fn new(series: SeriesKey, range: TimeRange) -> Self {
        Self { series, range }
    }
}

struct ModsInner {
    deletions: Vec<Deletion>,
    file: Option<File>,
}

/// Append-only `.mods` file of one data file
pub struct ModificationFile {
    path: PathBuf,
    inner: Mutex<ModsInner>,
}

impl ModificationFile {
    /// Load existing deletions; a torn tail is cut off
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let scan = frame::read_all::<Deletion>(&path)?;
        if scan.torn {
            warn!(
                "Truncating torn modification file {:?} at {} bytes",
                path, scan.valid_len
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(ModsInner {
                deletions: scan.records,
                file: None,
            }),
        })
    }

    /// Path of the modification file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and fsync one deletion
    pub fn append(&self, deletion: Deletion) -> Result<()> {
        let record = frame::encode(&deletion)?;
        let mut inner = self.inner.lock();

        if inner.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            inner.file = Some(file);
        }
        if let Some(file) = inner.file.as_mut() {
            file.write_all(&record)?;
            file.sync_data()?;
        }

        inner.deletions.push(deletion);
        Ok(())
    }

    /// Number of recorded deletions
    pub fn len(&self) -> usize {
        self.inner.lock().deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All recorded deletions in append order
    pub fn deletions(&self) -> Vec<Deletion> {
        self.inner.lock().deletions.clone()
    }

    /// Deletions recorded after the first `skip`
    pub fn deletions_since(&self, skip: usize) -> Vec<Deletion> {
        self.inner
            .lock()
            .deletions
            .iter()
            .skip(skip)
            .cloned()
            .collect()
    }

    /// Deleted ranges of one series
    pub fn ranges_for(&self, series: &SeriesKey) -> Vec<TimeRange> {
        self.inner
            .lock()
            .deletions
            .iter()
            .filter(|d| &d.series == series)
            .map(|d| d.range)
            .collect()
    }

    /// Close the handle and remove the file
    pub fn remove(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file = None;
        inner.deletions.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ModificationFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModificationFile")
            .field("path", &self.path)
            .field("deletions", &self.len())
            .finish()
    }
}
