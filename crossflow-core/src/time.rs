//! Time handling for the controller
//!
//! All timing decisions (green elapsed, clearance intervals, reading
//! staleness) are made against millisecond timestamps supplied by a
//! [`Clock`], never against wall-clock reads scattered through the code.
//! This keeps the phase state machine and fusion staleness checks fully
//! deterministic under test: a [`ManualClock`] is advanced by hand while
//! production uses [`SystemClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Timestamp in milliseconds since epoch (or test origin for manual clocks)
pub type Timestamp = u64;

/// Milliseconds in one second, for config fields expressed in seconds
pub const MILLIS_PER_SEC: u64 = 1000;

/// Source of time for the system
pub trait Clock: Send + Sync {
    /// Get current timestamp in milliseconds
    fn now(&self) -> Timestamp;
}

/// System time source
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        use std::time::{SystemTime, UNIX_EPOCH};

        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually advanced time source for tests and simulation
///
/// Cloning shares the underlying counter, so a test can hold one handle
/// and hand another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(timestamp)),
        }
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.now_ms.store(timestamp, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Delta between two timestamps, saturating at zero if time went backwards
pub fn delta_ms(earlier: Timestamp, later: Timestamp) -> u64 {
    later.saturating_sub(earlier)
}
