//! Aggregation Engine
//!
//! Folds event occurrences into per-day aggregate values:
//!
//! - **aggregator**: Pure combine functions (counter and index histogram)
//! - **capacity**: Event-vector and string buffer limits, checked against the store
//!
//! # Write Path
//!
//! ```text
//! Occurrence → capacity gate → combine(existing, occurrence) → AggregateStore row
//! ```
//!
//! The gate and the read-combine-write run inside one store transaction.

pub mod aggregator;
pub mod capacity;

pub use aggregator::{combine, initial_value, Occurrence};
pub use capacity::{assign_string_index, can_add_event_vector, StringIndex};
