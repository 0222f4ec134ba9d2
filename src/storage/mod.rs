//! Cobalt Storage Layer
//!
//! This module provides the transactional store behind the aggregation pipeline:
//!
//! - **types**: Core data structures (ReportKey, EventVector, SystemProfile, AggregateValue)
//! - **store**: SQLite-backed tables with composite-key operations
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Occurrence → Store::transaction → capacity check → read-combine-write
//!
//! Read Path:
//!   Day index → AggregateStore ⋈ SystemProfiles → EventRecords
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use cobalt_store::storage::{AggregateValue, EventVector, ReportKey, Store, SystemProfile};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::open(std::path::Path::new("./cobalt.db"))?;
//!     let report = ReportKey::new(1, 1, 1, 1);
//!     let profile = SystemProfile::default().system_version("1.2.3");
//!
//!     store.transaction(|tx| {
//!         let hash = profile.content_hash()?;
//!         tx.insert_system_profile(hash, &profile)?;
//!         tx.insert_report_if_absent(&report, 19201)?;
//!         tx.insert_aggregate(&report, 19202, &EventVector::new(vec![1]), hash,
//!                             &AggregateValue::Integer(1))
//!     })?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use store::{Store, StoreStats, StoreTx};
pub use types::{
    AggregateRow, AggregateValue, DayIndex, EventRecord, EventVector, GlobalKey,
    ObservationBatch, ObservationMetadata, QueuedObservation, ReportKey, StringHash,
    SystemProfile, SystemProfileHash,
};
