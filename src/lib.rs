//! midiclock - A real-time clock synchronization engine for audio/MIDI
//! playback timing.
//!
//! This library maintains a continuously corrected mapping between
//! wall-clock time and the number of audio frames rendered to a playback
//! device, and uses it to schedule MIDI events at precise frame
//! positions while compensating for device jitter, buffer x-runs, and
//! sample rate drift.

pub mod clock;
pub mod stream;

// Re-export commonly used types
pub use clock::{now_nanos, ClockSyncState, DriftTracker, TimeSnapshot, NANOS_PER_SECOND};
pub use stream::{ConfigError, MidiTimestamper, StreamClock, StreamConfig};
