//! WAL entry types

use crate::{SeriesKey, TimeRange, Timestamp, TsValue};
use serde::{Deserialize, Serialize};

/// A single WAL entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// One point written to the memtable
    Insert {
        series: SeriesKey,
        timestamp: Timestamp,
        value: TsValue,
    },
    /// A deletion applied to the memtable
    Delete { series: SeriesKey, range: TimeRange },
}

impl WalEntry {
    pub fn insert(series: &SeriesKey, timestamp: Timestamp, value: &TsValue) -> Self {
        WalEntry::Insert {
            series: series.clone(),
            timestamp,
            value: value.clone(),
        }
    }

    pub fn delete(series: &SeriesKey, range: TimeRange) -> Self {
        WalEntry::Delete {
            series: series.clone(),
            range,
        }
    }

    pub fn series(&self) -> &SeriesKey {
        match self {
            WalEntry::Insert { series, .. } | WalEntry::Delete { series, .. } => series,
        }
    }
}
