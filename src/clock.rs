//! Time sources for pipeline synchronization.
//!
//! This module provides:
//! - [`Clock`]: Trait for wall-time sources (signed microseconds)
//! - [`SystemClock`]: Wall clock backed by `SystemTime`, made monotonic
//! - [`ManualClock`]: Externally driven clock for deterministic tests

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds per second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// A source of wall time in microseconds.
///
/// Implementations must be monotonic (never go backwards).
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> i64;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// System wall clock.
///
/// The value is anchored to `SystemTime` when the clock is created and then
/// advanced with `Instant`, so wall-clock adjustments never move it backwards.
pub struct SystemClock {
    epoch: Instant,
    epoch_micros: i64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        let epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self {
            epoch: Instant::now(),
            epoch_micros,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_micros(&self) -> i64 {
        self.epoch_micros + self.epoch.elapsed().as_micros() as i64
    }

    fn name(&self) -> &str {
        "system"
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock that only moves when told to.
///
/// ```rust
/// use stagegraph::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_millis(5));
/// assert_eq!(clock.now_micros(), 6_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `start` microseconds.
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as i64, Ordering::AcqRel);
    }

    /// Set the clock to an absolute value; ignored if it would go backwards.
    pub fn set(&self, micros: i64) {
        self.now.fetch_max(micros, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        "manual"
    }
}
