//! Monotonic clock source for ingestion timestamps
//!
//! Ingestion times order chunk ids and index rows, so they must never go
//! backward even when the wall clock does (NTP adjustment). The clock keeps a
//! high-water mark and hands out `max(wall, previous + 1)`.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source that guarantees monotonically increasing millisecond
/// timestamps.
#[derive(Debug, Default)]
pub struct IngestionClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
}

impl IngestionClock {
    /// Create a new clock starting from the current wall time.
    pub fn new() -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
        }
    }

    /// Returns a monotonically increasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous high-water
    /// mark + 1ms instead.
    pub fn now_ms(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// Observe an externally supplied timestamp (e.g. a fixed override used by
    /// repeatable downsample runs) so subsequent `now_ms` calls stay ahead of it.
    pub fn observe(&self, ts_ms: i64) {
        let mut prev = self.high_water_ms.load(Ordering::Acquire);
        while ts_ms > prev {
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => prev = actual,
            }
        }
    }
}
