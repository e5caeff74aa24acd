//! Double-buffered time snapshots for lock-free clock hand-off.
//!
//! The rendering thread periodically publishes a fresh mapping between
//! wall-clock time and rendered frame position; the MIDI thread reads the
//! current mapping at arbitrary times. Neither side may block, so the
//! exchange uses two fixed slots and a single atomic selector index
//! instead of a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// A single consistent {time, frame count, rate} triple used as an
/// extrapolation anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSnapshot {
    /// Monotonic wall-clock time of the measurement, in nanoseconds.
    pub nanos: i64,
    /// Frames handed to the playback device as of `nanos`.
    pub frames: u64,
    /// Estimated actual device sample rate at that instant.
    /// May differ from the nominal rate by a bounded amount.
    pub sample_rate: f64,
}

impl TimeSnapshot {
    /// Creates the initial snapshot for a stream that has rendered nothing.
    pub fn initial(nanos: i64, sample_rate: f64) -> Self {
        Self {
            nanos,
            frames: 0,
            sample_rate,
        }
    }
}

/// One snapshot slot, stored as individual atomics so the writer can
/// repopulate it without taking a lock.
struct Slot {
    nanos: AtomicI64,
    frames: AtomicU64,
    /// Sample rate as f64 bits; f64 has no atomic type of its own.
    rate_bits: AtomicU64,
}

impl Slot {
    fn new(snapshot: TimeSnapshot) -> Self {
        Self {
            nanos: AtomicI64::new(snapshot.nanos),
            frames: AtomicU64::new(snapshot.frames),
            rate_bits: AtomicU64::new(snapshot.sample_rate.to_bits()),
        }
    }

    fn store(&self, snapshot: TimeSnapshot) {
        self.nanos.store(snapshot.nanos, Ordering::Relaxed);
        self.frames.store(snapshot.frames, Ordering::Relaxed);
        self.rate_bits
            .store(snapshot.sample_rate.to_bits(), Ordering::Relaxed);
    }

    fn load(&self) -> TimeSnapshot {
        TimeSnapshot {
            nanos: self.nanos.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            sample_rate: f64::from_bits(self.rate_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Double-buffered snapshot exchange between the rendering thread
/// (writer) and the MIDI thread (reader).
///
/// The writer fills the non-selected slot, then publishes it by flipping
/// the selector; the flip is the single hand-off point. The release store
/// on the selector orders the slot writes before the flip, so a reader
/// that observes the new index observes the new snapshot. The reader may
/// still consult the non-selected slot (the previous epoch) for events
/// whose reference time predates the selected snapshot; a writer that
/// starts refilling that slot concurrently can hand such a reader a
/// half-updated triple. That race is tolerated: it needs two full update
/// periods to occur and the predictor's lateness handling absorbs the
/// resulting error.
pub struct ClockSyncState {
    slots: [Slot; 2],
    selector: AtomicUsize,
}

impl ClockSyncState {
    /// Creates the state with both slots holding `initial`, so reads are
    /// valid before the first publish.
    pub fn new(initial: TimeSnapshot) -> Self {
        Self {
            slots: [Slot::new(initial), Slot::new(initial)],
            selector: AtomicUsize::new(0),
        }
    }

    /// Returns the index of the currently selected slot.
    pub fn selected_index(&self) -> usize {
        self.selector.load(Ordering::Acquire)
    }

    /// Reads the snapshot in slot `index` (0 or 1).
    pub fn snapshot_at(&self, index: usize) -> TimeSnapshot {
        self.slots[index & 1].load()
    }

    /// Reads the currently selected snapshot.
    pub fn selected_snapshot(&self) -> TimeSnapshot {
        self.snapshot_at(self.selected_index())
    }

    /// Reads the non-selected snapshot, i.e. the previous epoch.
    #[allow(dead_code)]
    pub fn previous_snapshot(&self) -> TimeSnapshot {
        self.snapshot_at(1 - self.selected_index())
    }

    /// Publishes `snapshot`: writes it into the non-selected slot, then
    /// flips the selector. Must only be called from the single writer
    /// thread.
    pub fn publish(&self, snapshot: TimeSnapshot) {
        let next = 1 - self.selector.load(Ordering::Relaxed);
        self.slots[next].store(snapshot);
        self.selector.store(next, Ordering::Release);
    }
}
