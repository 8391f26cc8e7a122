//! WAL reader for recovery

use super::WalEntry;
use crate::frame;
use crate::memtable::MemTable;
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// WAL reader for recovering the memtable of a working file after a crash
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Recover all intact entries; a torn tail from a crash mid-append is dropped
    pub fn recover(&self) -> Result<Vec<WalEntry>> {
        let scan = frame::read_all::<WalEntry>(&self.path)?;
        if scan.torn {
            warn!(
                "Ignoring torn tail of {:?} after {} bytes",
                self.path, scan.valid_len
            );
        }
        info!(
            "Recovered {} entries from {:?}",
            scan.records.len(),
            self.path
        );
        Ok(scan.records)
    }

    /// Replay the log into `memtable`, returning the number of applied entries
    pub fn replay_into(&self, memtable: &MemTable) -> Result<usize> {
        let entries = self.recover()?;
        let mut applied = 0;
        for entry in entries {
            match entry {
                WalEntry::Insert {
                    series,
                    timestamp,
                    value,
                } => {
                    if let Err(e) = memtable.insert(&series, timestamp, value) {
                        warn!("Skipping WAL insert for {}: {}", series, e);
                        continue;
                    }
                }
                WalEntry::Delete { series, range } => {
                    memtable.delete(&series, &range);
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}
