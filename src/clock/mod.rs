//! Monotonic time primitives and the lock-free playback clock state.
//!
//! This module provides the low-level building blocks for clock
//! synchronization:
//! - A monotonic nanosecond clock shared by every thread
//! - Immutable time snapshots anchoring frame-position extrapolation
//! - A double-buffered snapshot exchange for wait-free cross-thread reads
//! - The drift tracker contract for external rate correction

mod drift;
mod snapshot;

pub use drift::DriftTracker;
pub use snapshot::{ClockSyncState, TimeSnapshot};

use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds per second, for frame/time conversions.
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
#[allow(dead_code)]
pub const NANOS_PER_MILLISECOND: i64 = 1_000_000;

/// Milliseconds per second, for latency conversions.
pub const MILLIS_PER_SECOND: i64 = 1_000;

/// Process-wide anchor for the monotonic clock.
/// Initialized lazily on the first `now_nanos` call.
static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Returns the current monotonic time in nanoseconds.
///
/// The zero point is the first call in the process; only differences
/// between readings are meaningful. Readings never decrease.
pub fn now_nanos() -> i64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}
