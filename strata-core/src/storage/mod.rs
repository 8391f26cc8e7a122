//! Storage engine - coordinates all storage components
//!
//! ```text
//! <data_dir>/<storage group>/<partition>/
//!     sequence/{version:020}-{level}.tsfile[.resource|.mods|.wal]
//!     unsequence/...
//!     compaction-*.log
//! ```

mod engine;
mod flush;
mod group;
mod partition;


pub use engine::{EngineStats, SeriesReader, StorageEngine};
pub use flush::{FlushHandle, FlushManager};
pub use group::{GroupStats, StorageGroup};
pub use partition::{PartitionStats, TimePartition};

use crate::compaction::CompactionConfig;
use crate::tsfile::TsFileConfig;
use crate::wal::WalConfig;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Width of a time partition, in timestamp units
    pub partition_interval: i64,
    /// MemTable size limit in bytes
    pub memtable_size_limit: usize,
    /// Number of flush threads
    pub flush_thread_count: usize,
    pub wal: WalConfig,
    pub tsfile: TsFileConfig,
    pub compaction: CompactionConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            partition_interval: crate::config::PARTITION_INTERVAL,
            memtable_size_limit: crate::config::MEMTABLE_SIZE_LIMIT,
            flush_thread_count: crate::config::FLUSH_THREAD_COUNT,
            wal: WalConfig::default(),
            tsfile: TsFileConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Load a JSON configuration file; absent fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| StrataError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_interval <= 0 {
            return Err(StrataError::Config(
                "partition_interval must be positive".into(),
            ));
        }
        if self.memtable_size_limit == 0 {
            return Err(StrataError::Config(
                "memtable_size_limit must be positive".into(),
            ));
        }
        if self.tsfile.max_points_per_chunk == 0 {
            return Err(StrataError::Config(
                "max_points_per_chunk must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Partition holding `timestamp`
    pub fn partition_of(&self, timestamp: crate::Timestamp) -> i64 {
        timestamp.div_euclid(self.partition_interval)
    }
}
