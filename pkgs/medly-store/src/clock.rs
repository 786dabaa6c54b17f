//! Server-side timestamps for message ordering

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond clock that never repeats or goes backwards.
///
/// Messages are ordered by the timestamp this clock hands out, so two sends
/// within the same millisecond still get distinct, increasing values.
#[derive(Debug, Default)]
pub struct ServerClock {
    last: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure every later timestamp is strictly greater than `millis`
    pub fn observe(&self, millis: i64) {
        self.last.fetch_max(millis, Ordering::AcqRel);
    }

    /// Next timestamp in Unix milliseconds
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
