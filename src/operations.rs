//! Operation logging
//!
//! Counters describing the pipeline's own behavior, consumed by whatever
//! observability layer the host application runs.

use std::collections::HashMap;
use std::sync::Mutex;

/// Receiver for internal operation events
pub trait OperationLogger: Send + Sync {
    /// A string was dropped because its report's string buffer was full
    fn record_string_buffer_max_exceeded(&self, metric_id: u32, report_id: u32);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpOperationLogger;

impl OperationLogger for NoOpOperationLogger {
    fn record_string_buffer_max_exceeded(&self, _metric_id: u32, _report_id: u32) {}
}

/// Keeps in-memory counts per (metric_id, report_id)
#[derive(Debug, Default)]
pub struct CountingOperationLogger {
    string_buffer_max_exceeded: Mutex<HashMap<(u32, u32), u64>>,
}

impl CountingOperationLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times a string was dropped for (metric_id, report_id)
    pub fn string_buffer_max_exceeded(&self, metric_id: u32, report_id: u32) -> u64 {
        self.string_buffer_max_exceeded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(metric_id, report_id))
            .copied()
            .unwrap_or(0)
    }
}

impl OperationLogger for CountingOperationLogger {
    fn record_string_buffer_max_exceeded(&self, metric_id: u32, report_id: u32) {
        let mut counts = self
            .string_buffer_max_exceeded
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *counts.entry((metric_id, report_id)).or_insert(0) += 1;
    }
}
