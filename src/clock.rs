//! Time sources
//!
//! Rate windows and circuit timestamps are stored as milliseconds since the
//! Unix epoch so they stay meaningful in a shared store. [`MonotonicClock`]
//! anchors the epoch once and advances with a monotonic instant, so readings
//! never go backwards even if the wall clock is adjusted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Millisecond time source
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch. Never decreases.
    fn now_millis(&self) -> u64;
}

/// Wall-clock anchored monotonic clock.
///
/// Uses `tokio::time::Instant`, so a paused tokio test runtime also pauses
/// this clock.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor_millis: u64,
    anchor: Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at the current wall-clock time
    #[must_use]
    pub fn new() -> Self {
        let anchor_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            anchor_millis: u64::try_from(anchor_millis).unwrap_or(u64::MAX),
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.anchor_millis.saturating_add(elapsed)
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_millis`
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    /// Set the clock, ignoring values earlier than the current reading
    pub fn set(&self, millis: u64) {
        self.now.fetch_max(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
