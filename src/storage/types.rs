//! Core data types for the Cobalt aggregate store
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `ReportKey`: Composite identifier of a configured metric/report pair
//! - `EventVector`: The event codes an occurrence was logged with
//! - `SystemProfile`: Device/software environment, stored once per content hash
//! - `AggregateValue`: Counter or index histogram accumulated per day
//! - `ObservationBatch`: Opaque generated observations queued for upload

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};

/// Days since the Unix epoch (UTC)
pub type DayIndex = u32;

/// Content hash of a serialized `SystemProfile`
pub type SystemProfileHash = i64;

/// Stable identifier of a report, defined by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportKey {
    pub customer_id: u32,
    pub project_id: u32,
    pub metric_id: u32,
    pub report_id: u32,
}

impl ReportKey {
    pub fn new(customer_id: u32, project_id: u32, metric_id: u32, report_id: u32) -> Self {
        Self {
            customer_id,
            project_id,
            metric_id,
            report_id,
        }
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.customer_id, self.project_id, self.metric_id, self.report_id
        )
    }
}

/// Ordered event codes identifying which event dimensions fired
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventVector(Vec<u32>);

impl EventVector {
    pub fn new(codes: impl Into<Vec<u32>>) -> Self {
        Self(codes.into())
    }

    pub fn codes(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma separated form used as part of the aggregate primary key
    pub fn to_db_string(&self) -> String {
        self.0
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_db_string(s: &str) -> StorageResult<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        s.split(',')
            .map(|part| {
                part.parse::<u32>().map_err(|e| {
                    StorageError::Corruption(format!("invalid event vector {:?}: {}", s, e))
                })
            })
            .collect::<StorageResult<Vec<_>>>()
            .map(Self)
    }
}

impl From<Vec<u32>> for EventVector {
    fn from(codes: Vec<u32>) -> Self {
        Self(codes)
    }
}

/// Description of the device and software environment at aggregation time
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemProfile {
    pub os: String,
    pub arch: String,
    pub board_name: String,
    pub product_name: String,
    pub system_version: String,
    pub app_version: String,
    pub channel: String,
    #[serde(default)]
    pub experiment_ids: Vec<i64>,
}

impl SystemProfile {
    /// Builder method: set the system version
    pub fn system_version(mut self, version: impl Into<String>) -> Self {
        self.system_version = version.into();
        self
    }

    /// Builder method: set the app version
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Content hash over the serialized form
    pub fn content_hash(&self) -> StorageResult<SystemProfileHash> {
        Ok(hash_prefix(&self.to_bytes()?))
    }
}

fn hash_prefix(bytes: &[u8]) -> i64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// Accumulated value for one aggregate row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateValue {
    /// Running sum of occurrence counts
    Integer(i64),
    /// Bucket index → count, ascending by index
    IndexHistogram(BTreeMap<u32, i64>),
}

impl AggregateValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AggregateValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&BTreeMap<u32, i64>> {
        match self {
            AggregateValue::IndexHistogram(h) => Some(h),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// SHA-256 of a logged string value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringHash([u8; 32]);

impl StringHash {
    pub fn of(value: &str) -> Self {
        Self(Sha256::digest(value.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> StorageResult<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            StorageError::Corruption(format!("string hash has {} bytes, expected 32", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

/// Identifies the report and day a batch of observations was generated for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    pub report: ReportKey,
    pub day_index: DayIndex,
    pub system_profile: Option<SystemProfile>,
}

/// A batch of encoded observations, passed through this crate untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationBatch {
    pub metadata: ObservationMetadata,
    /// Encoded observations, opaque to the store
    pub observations: Vec<Vec<u8>>,
}

impl ObservationBatch {
    pub fn new(metadata: ObservationMetadata, observations: Vec<Vec<u8>>) -> Self {
        Self {
            metadata,
            observations,
        }
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A queued observation batch with its queue id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedObservation {
    pub id: i64,
    pub batch: ObservationBatch,
}

/// One aggregated event for a day, as handed to observation generators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_vector: EventVector,
    pub aggregate_value: AggregateValue,
}

/// A full aggregate row with its system profile resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub report: ReportKey,
    pub day_index: DayIndex,
    pub event_vector: EventVector,
    pub system_profile: SystemProfile,
    pub aggregate_value: AggregateValue,
}

/// Keys of the global values table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalKey {
    InitialEnabledTime,
    InitialDisabledTime,
}

impl GlobalKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalKey::InitialEnabledTime => "INITIAL_ENABLED_TIME",
            GlobalKey::InitialDisabledTime => "INITIAL_DISABLED_TIME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INITIAL_ENABLED_TIME" => Some(GlobalKey::InitialEnabledTime),
            "INITIAL_DISABLED_TIME" => Some(GlobalKey::InitialDisabledTime),
            _ => None,
        }
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_vector_db_string() {
        let ev = EventVector::new(vec![1, 5]);
        assert_eq!(ev.to_db_string(), "1,5");
        assert_eq!(EventVector::from_db_string("1,5").unwrap(), ev);

        let empty = EventVector::default();
        assert_eq!(empty.to_db_string(), "");
        assert_eq!(EventVector::from_db_string("").unwrap(), empty);

        assert!(EventVector::from_db_string("1,x").is_err());
    }

    #[test]
    fn test_system_profile_hash_is_content_based() {
        let a = SystemProfile::default().system_version("1.2.3");
        let b = SystemProfile::default().system_version("1.2.3");
        let c = SystemProfile::default().system_version("2.4.8");

        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_aggregate_value_bytes() {
        let mut buckets = BTreeMap::new();
        buckets.insert(0, 2);
        buckets.insert(1, 1);
        let value = AggregateValue::IndexHistogram(buckets);

        let bytes = value.to_bytes().unwrap();
        assert_eq!(AggregateValue::from_bytes(&bytes).unwrap(), value);
        assert!(AggregateValue::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_string_hash() {
        assert_eq!(StringHash::of("A"), StringHash::of("A"));
        assert_ne!(StringHash::of("A"), StringHash::of("B"));

        let hash = StringHash::of("A");
        assert_eq!(StringHash::from_slice(hash.as_bytes()).unwrap(), hash);
        assert!(StringHash::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_global_key_names() {
        for key in [GlobalKey::InitialEnabledTime, GlobalKey::InitialDisabledTime] {
            assert_eq!(GlobalKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(GlobalKey::parse("OTHER"), None);
    }
}
