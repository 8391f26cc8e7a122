//! Storage group - the time partitions of one database

use super::partition::{PartitionStats, TimePartition};
use super::StorageConfig;
use crate::{Result, StrataError, TimeRange};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage group statistics
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub name: String,
    pub partitions: Vec<PartitionStats>,
}

/// One storage group and its partitions, keyed by partition number
pub struct StorageGroup {
    name: String,
    dir: PathBuf,
    config: Arc<StorageConfig>,
    partitions: RwLock<BTreeMap<i64, Arc<TimePartition>>>,
}

impl StorageGroup {
    /// Create or open a storage group directory
    pub fn open(name: &str, data_dir: &Path, config: Arc<StorageConfig>) -> Result<Self> {
        validate_name(name)?;
        let dir = data_dir.join(name);
        std::fs::create_dir_all(&dir)?;

        let mut partitions = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(partition) = file_name.to_str().and_then(|n| n.parse::<i64>().ok()) else {
                warn!("Ignoring unexpected directory {:?}", entry.path());
                continue;
            };
            let opened = TimePartition::open(name, partition, entry.path(), Arc::clone(&config))?;
            partitions.insert(partition, Arc::new(opened));
        }
        if !partitions.is_empty() {
            info!("Loaded storage group {} ({} partitions)", name, partitions.len());
        }

        Ok(Self {
            name: name.to_string(),
            dir,
            config,
            partitions: RwLock::new(partitions),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition(&self, partition: i64) -> Option<Arc<TimePartition>> {
        self.partitions.read().get(&partition).cloned()
    }

    /// Get or create the partition with the given number
    pub fn get_or_create_partition(&self, partition: i64) -> Result<Arc<TimePartition>> {
        if let Some(existing) = self.partition(partition) {
            return Ok(existing);
        }

        let mut partitions = self.partitions.write();
        if let Some(existing) = partitions.get(&partition) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(TimePartition::open(
            &self.name,
            partition,
            self.dir.join(partition.to_string()),
            Arc::clone(&self.config),
        )?);
        partitions.insert(partition, Arc::clone(&created));
        Ok(created)
    }

    /// All partitions, oldest first
    pub fn partitions(&self) -> Vec<Arc<TimePartition>> {
        self.partitions.read().values().cloned().collect()
    }

    /// Partitions whose time span overlaps `range`, oldest first
    pub fn partitions_in(&self, range: &TimeRange) -> Vec<Arc<TimePartition>> {
        let first = self.config.partition_of(range.start);
        let last = self.config.partition_of(range.end);
        if first > last {
            return Vec::new();
        }
        self.partitions
            .read()
            .range(first..=last)
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }

    pub fn stats(&self) -> GroupStats {
        GroupStats {
            name: self.name.clone(),
            partitions: self.partitions().iter().map(|p| p.stats()).collect(),
        }
    }
}

/// Storage group names become directory names
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StrataError::Config(format!("Invalid storage group name: {:?}", name)))
    }
}
