//! Strata Core - time-series storage and compaction engine
//!
//! Points are routed per time partition into a sequence lane (newer than
//! anything flushed for the device) or an unsequence lane (late or
//! overwriting data), buffered in memory and flushed to immutable files.
//!
//! # Architecture
//!
//! - **WAL**: per working file, replayed when a flush did not complete
//! - **MemTable**: per-series chunks over copy-on-write sorted lists
//! - **TsFile**: immutable chunked series files with a `.resource` index and
//!   a `.mods` deletion log
//! - **Compaction**: size-tiered inner-space merges and in-place cross-space
//!   merges, journaled so an interrupted merge is rolled back or finished
//! - **Query**: priority merge over memory and file sources, newest source
//!   wins on equal timestamps

pub mod compaction;
pub mod memtable;
pub mod query;
pub mod resource;
pub mod storage;
pub mod tsfile;
pub mod wal;

mod error;
mod frame;
mod types;

pub use error::{Result, StrataError};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum MemTable size before flush (64MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// Points per chunk written to a data file
    pub const DEFAULT_MAX_POINTS_PER_CHUNK: usize = 100_000;

    /// Width of a time partition (one week of milliseconds)
    pub const PARTITION_INTERVAL: i64 = 7 * 24 * 60 * 60 * 1000;

    /// Flush worker threads
    pub const FLUSH_THREAD_COUNT: usize = 2;
}
