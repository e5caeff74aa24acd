//! Stream-level timing policy.
//!
//! This module ties the clock primitives into the per-stream engine:
//! - Configuration consumed once at stream construction
//! - Latency derivation and automatic adaptation
//! - The stream clock itself, split into a write side for the rendering
//!   thread and a read side for the MIDI thread

pub mod config;
pub mod latency;
pub mod timer;

pub use config::{ConfigError, SrcQuality, StreamConfig};
pub use latency::LatencyState;
pub use timer::{MidiTimestamper, StreamClock};
