//! Write-Ahead Log (WAL) implementation
//!
//! Every working file has its own log next to it. Inserts and deletions are
//! appended before they touch the memtable; once the memtable is flushed and
//! the file sealed, the log is removed. On restart a remaining log is
//! replayed into a fresh memtable and flushed before writes resume.

mod entry;
mod reader;
mod writer;

pub use entry::WalEntry;
pub use reader::WalReader;
pub use writer::WalWriter;

use serde::{Deserialize, Serialize};

/// When appended entries reach the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// fsync every append
    Immediate,
    /// fsync once N appends are pending
    EveryN(usize),
    /// fsync when the last sync is older than `millis`
    Interval { millis: u64 },
    /// Leave it to the page cache
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// Per-working-file log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Without a log, unflushed memtables are lost on a crash
    pub enabled: bool,
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_policy: SyncPolicy::default(),
        }
    }
}
