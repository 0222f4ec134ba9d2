//! Clock abstraction
//!
//! Wall-clock time is injected so enablement bookkeeping and day indices can
//! be tested deterministically.

use crate::storage::DayIndex;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Day index of the current time
    fn today(&self) -> DayIndex {
        day_index(self.now())
    }
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Days since the Unix epoch in UTC; times before the epoch map to day 0
pub fn day_index(time: DateTime<Utc>) -> DayIndex {
    let days = time.timestamp().div_euclid(SECONDS_PER_DAY);
    days.clamp(0, i64::from(DayIndex::MAX)) as DayIndex
}
