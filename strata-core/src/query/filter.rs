//! Query predicates
//!
//! The time predicate is pushed into every source reader. Value predicates
//! are evaluated only on the point that wins priority resolution, so a
//! filtered-out overwrite never lets an older value resurface.

use crate::{TimeRange, Timestamp, TsValue};
use serde::{Deserialize, Serialize};

/// Predicate over a point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum ValueFilter {
    Eq(TsValue),
    NotEq(TsValue),
    Gt(f64),
    GtEq(f64),
    Lt(f64),
    LtEq(f64),
    /// Inclusive numeric range
    Between(f64, f64),
    And(Box<ValueFilter>, Box<ValueFilter>),
    Or(Box<ValueFilter>, Box<ValueFilter>),
    Not(Box<ValueFilter>),
}

impl ValueFilter {
    /// Evaluate against a value; numeric comparisons fail on non-numeric values
    pub fn matches(&self, value: &TsValue) -> bool {
        match self {
            ValueFilter::Eq(expected) => value == expected,
            ValueFilter::NotEq(expected) => value != expected,
            ValueFilter::Gt(bound) => value.as_f64().map_or(false, |v| v > *bound),
            ValueFilter::GtEq(bound) => value.as_f64().map_or(false, |v| v >= *bound),
            ValueFilter::Lt(bound) => value.as_f64().map_or(false, |v| v < *bound),
            ValueFilter::LtEq(bound) => value.as_f64().map_or(false, |v| v <= *bound),
            ValueFilter::Between(low, high) => value
                .as_f64()
                .map_or(false, |v| v >= *low && v <= *high),
            ValueFilter::And(left, right) => left.matches(value) && right.matches(value),
            ValueFilter::Or(left, right) => left.matches(value) || right.matches(value),
            ValueFilter::Not(inner) => !inner.matches(value),
        }
    }

    pub fn and(self, other: ValueFilter) -> ValueFilter {
        ValueFilter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: ValueFilter) -> ValueFilter {
        ValueFilter::Or(Box::new(self), Box::new(other))
    }
}

/// Combined time and value predicate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub time: Option<TimeRange>,
    pub value: Option<ValueFilter>,
}

impl Filter {
    /// Restrict to an inclusive time range
    pub fn time_range(start: Timestamp, end: Timestamp) -> Self {
        Self {
            time: Some(TimeRange::new(start, end)),
            value: None,
        }
    }

    /// Restrict by value
    pub fn value(filter: ValueFilter) -> Self {
        Self {
            time: None,
            value: Some(filter),
        }
    }

    pub fn with_value(mut self, filter: ValueFilter) -> Self {
        self.value = Some(match self.value.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Time range to scan; the whole timeline without a time predicate
    pub fn scan_range(&self) -> TimeRange {
        self.time.unwrap_or_else(TimeRange::all)
    }

    pub fn satisfies_time(&self, timestamp: Timestamp) -> bool {
        self.time.map_or(true, |range| range.contains(timestamp))
    }

    pub fn satisfies_value(&self, value: &TsValue) -> bool {
        self.value.as_ref().map_or(true, |f| f.matches(value))
    }
}
