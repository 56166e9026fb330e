use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Issues ordering identifiers for messages, channels, users, and listings.
///
/// Ids are millisecond wall-clock values, bumped past the last issued value
/// when the clock has not advanced, so a later call never sees a smaller id
/// and sequential appends to one channel get strictly increasing ids.
/// Consumers still treat ids as ordering cursors, not uniqueness keys; row
/// identity enforces uniqueness where it matters.
#[derive(Debug, Default)]
pub struct MessageSequencer {
    last: AtomicI64,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
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
