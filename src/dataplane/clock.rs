//! Logical clock
//!
//! Every timer in the engine (FDB ageing, neighbor retries, conntrack
//! expiry) reads this clock instead of wall time. Only the caller moves
//! it forward.

use serde::Serializer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic millisecond clock advanced explicitly
#[derive(Debug, Default)]
pub struct LogicalClock {
    now_ms: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since the clock was created
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::Acquire))
    }

    /// Move the clock forward and return the new time
    pub fn advance(&self, by: Duration) -> Duration {
        let by_ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let prev = self.now_ms.fetch_add(by_ms, Ordering::AcqRel);
        Duration::from_millis(prev.saturating_add(by_ms))
    }
}

/// Serialize a clock reading as whole milliseconds
pub fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}
