//! Combine functions for aggregate values
//!
//! An aggregate value is either a counter or an index histogram. Combining
//! never fails: a stored value of the wrong shape is treated as absent.

use crate::storage::AggregateValue;
use std::collections::BTreeMap;

/// A single event occurrence to fold into an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// Occurrence report: add `count` to the counter
    Count(i64),
    /// String report: bump the bucket assigned to the string
    StringIndex(u32),
}

/// Combine a new occurrence with the existing stored value, if any
pub fn combine(existing: Option<&AggregateValue>, occurrence: Occurrence) -> AggregateValue {
    match occurrence {
        Occurrence::Count(count) => {
            let base = existing.and_then(AggregateValue::as_integer).unwrap_or(0);
            AggregateValue::Integer(base.saturating_add(count))
        }
        Occurrence::StringIndex(index) => {
            let mut buckets = existing
                .and_then(AggregateValue::as_histogram)
                .cloned()
                .unwrap_or_else(BTreeMap::new);
            *buckets.entry(index).or_insert(0) += 1;
            AggregateValue::IndexHistogram(buckets)
        }
    }
}

/// Value of a freshly created aggregate row
pub fn initial_value(occurrence: Occurrence) -> AggregateValue {
    combine(None, occurrence)
}
