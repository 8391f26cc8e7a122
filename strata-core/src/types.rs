//! Core types for Strata

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Series identifier: a device path plus one measurement under it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Device path (e.g., "root.plant1.turbine7")
    pub device: String,
    /// Measurement name (e.g., "temperature")
    pub measurement: String,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// Parse a canonical `device.measurement` path; the last component is the measurement
    pub fn parse(path: &str) -> Option<Self> {
        let (device, measurement) = path.rsplit_once('.')?;
        if device.is_empty() || measurement.is_empty() {
            return None;
        }
        Some(Self::new(device, measurement))
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.device.len() + self.measurement.len()
    }

    /// Create a canonical string representation
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

/// Data type of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Boolean = 0,
    Int32 = 1,
    Int64 = 2,
    Float = 3,
    Double = 4,
    Text = 5,
    Vector = 6,
}

impl TryFrom<u8> for DataType {
    type Error = crate::StrataError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0 => Ok(DataType::Boolean),
            1 => Ok(DataType::Int32),
            2 => Ok(DataType::Int64),
            3 => Ok(DataType::Float),
            4 => Ok(DataType::Double),
            5 => Ok(DataType::Text),
            6 => Ok(DataType::Vector),
            _ => Err(crate::StrataError::InvalidFormat(format!(
                "Invalid data type: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
            DataType::Vector => "VECTOR",
        };
        f.write_str(name)
    }
}

/// A typed scalar or a vector of optional scalars (aligned measurements)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TsValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Vector(Vec<Option<TsValue>>),
}

impl TsValue {
    /// Data type of this value
    pub fn data_type(&self) -> DataType {
        match self {
            TsValue::Boolean(_) => DataType::Boolean,
            TsValue::Int32(_) => DataType::Int32,
            TsValue::Int64(_) => DataType::Int64,
            TsValue::Float(_) => DataType::Float,
            TsValue::Double(_) => DataType::Double,
            TsValue::Text(_) => DataType::Text,
            TsValue::Vector(_) => DataType::Vector,
        }
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        match self {
            TsValue::Boolean(_) => 1,
            TsValue::Int32(_) | TsValue::Float(_) => 4,
            TsValue::Int64(_) | TsValue::Double(_) => 8,
            TsValue::Text(s) => s.len(),
            TsValue::Vector(values) => values
                .iter()
                .map(|v| 1 + v.as_ref().map_or(0, TsValue::size))
                .sum(),
        }
    }

    /// Numeric view used by value filters
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TsValue::Int32(v) => Some(*v as f64),
            TsValue::Int64(v) => Some(*v as f64),
            TsValue::Float(v) => Some(*v as f64),
            TsValue::Double(v) => Some(*v),
            TsValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl From<f64> for TsValue {
    fn from(v: f64) -> Self {
        TsValue::Double(v)
    }
}

impl From<f32> for TsValue {
    fn from(v: f32) -> Self {
        TsValue::Float(v)
    }
}

impl From<i64> for TsValue {
    fn from(v: i64) -> Self {
        TsValue::Int64(v)
    }
}

impl From<i32> for TsValue {
    fn from(v: i32) -> Self {
        TsValue::Int32(v)
    }
}

impl From<bool> for TsValue {
    fn from(v: bool) -> Self {
        TsValue::Boolean(v)
    }
}

impl From<&str> for TsValue {
    fn from(v: &str) -> Self {
        TsValue::Text(v.to_string())
    }
}

impl From<String> for TsValue {
    fn from(v: String) -> Self {
        TsValue::Text(v)
    }
}

/// One point of one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: TsValue,
}

impl TimeValuePair {
    pub fn new(timestamp: Timestamp, value: impl Into<TsValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Time range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Degenerate range holding one timestamp
    pub fn point(ts: Timestamp) -> Self {
        Self::new(ts, ts)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Widen the range to cover `ts`
    pub fn extend(&mut self, ts: Timestamp) {
        self.start = self.start.min(ts);
        self.end = self.end.max(ts);
    }

    /// Smallest range covering both
    pub fn merge(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// Intersection, if any
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then(|| TimeRange::new(start, end))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Whether a file or buffer belongs to the sequence or unsequence space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lane {
    Sequence,
    Unsequence,
}

impl Lane {
    /// Directory name of the lane inside a partition
    pub fn dir_name(&self) -> &'static str {
        match self {
            Lane::Sequence => "sequence",
            Lane::Unsequence => "unsequence",
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, Lane::Sequence)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key() {
        let key = SeriesKey::new("root.sg1.d1", "temperature");
        assert_eq!(key.canonical(), "root.sg1.d1.temperature");
        assert_eq!(SeriesKey::parse("root.sg1.d1.temperature"), Some(key));
        assert_eq!(SeriesKey::parse("temperature"), None);
    }

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
        assert_eq!(range1.intersect(&range2), Some(TimeRange::new(150, 200)));
        assert_eq!(range1.intersect(&range3), None);
        assert_eq!(range1.merge(&range3), TimeRange::new(100, 400));
    }

    #[test]
    fn test_value_types() {
        assert_eq!(TsValue::from(1.5f64).data_type(), DataType::Double);
        assert_eq!(TsValue::from(7i32).as_f64(), Some(7.0));
        assert_eq!(TsValue::from("on").as_f64(), None);

        let vector = TsValue::Vector(vec![Some(TsValue::Int64(1)), None]);
        assert_eq!(vector.data_type(), DataType::Vector);
        assert_eq!(vector.size(), 10);
    }
}
