//! Scheduling latency derivation and adaptation.

use crate::clock::{MILLIS_PER_SECOND, NANOS_PER_SECOND};
use crate::stream::config::{StreamConfig, DEFAULT_AUTO_MIDI_LATENCY_MS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Converts a latency in milliseconds to frames at `sample_rate`.
pub fn frames_from_ms(ms: u32, sample_rate: u32) -> u64 {
    ms as u64 * sample_rate as u64 / MILLIS_PER_SECOND as u64
}

/// Latency targets for one stream.
///
/// `midi_latency_frames` is the lead time reserved between an event's
/// arrival and its intended playback; `audio_latency_frames` is the
/// device buffering depth. In automatic mode (configured MIDI latency of
/// 0) the MIDI latency starts at a small default and grows to absorb
/// observed scheduling shortfalls. It never shrinks: once jitter of a
/// given size has been seen, the stream keeps enough headroom for it.
///
/// The MIDI latency is read by the rendering thread for throttling and
/// written by the MIDI thread on shortfall, so it lives in an atomic.
/// Slight staleness on the reader side is tolerable.
pub struct LatencyState {
    midi_latency_frames: AtomicU64,
    audio_latency_frames: u64,
    auto: bool,
    /// Set when the MIDI latency grows; the rendering thread consumes it
    /// to push recomputed reset thresholds to the drift tracker.
    thresholds_dirty: AtomicBool,
}

impl LatencyState {
    /// Derives latency targets from the configured millisecond values.
    pub fn from_config(config: &StreamConfig) -> Self {
        let auto = config.is_auto_latency();
        let midi_latency_ms = if auto {
            DEFAULT_AUTO_MIDI_LATENCY_MS
        } else {
            config.midi_latency_ms
        };
        Self {
            midi_latency_frames: AtomicU64::new(frames_from_ms(
                midi_latency_ms,
                config.sample_rate,
            )),
            audio_latency_frames: frames_from_ms(config.audio_latency_ms, config.sample_rate),
            auto,
            thresholds_dirty: AtomicBool::new(false),
        }
    }

    /// Current MIDI scheduling latency in frames.
    pub fn midi_latency_frames(&self) -> u64 {
        self.midi_latency_frames.load(Ordering::Relaxed)
    }

    /// Device buffering depth in frames, fixed at construction.
    #[allow(dead_code)]
    pub fn audio_latency_frames(&self) -> u64 {
        self.audio_latency_frames
    }

    /// Returns whether automatic latency adaptation is active.
    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Grows the MIDI latency by `shortfall` frames and returns the new
    /// value. Called from the MIDI thread when an event's computed
    /// timestamp is already behind the rendered position.
    pub fn absorb_shortfall(&self, shortfall: u64) -> u64 {
        let grown = self
            .midi_latency_frames
            .fetch_add(shortfall, Ordering::Relaxed)
            + shortfall;
        self.thresholds_dirty.store(true, Ordering::Release);
        grown
    }

    /// Consumes the pending-thresholds flag. Returns `true` at most once
    /// per latency change; the caller then pushes fresh thresholds to the
    /// drift tracker.
    pub fn take_thresholds_update(&self) -> bool {
        self.thresholds_dirty.swap(false, Ordering::Acquire)
    }

    /// Computes the drift tracker reset threshold in nanoseconds: the
    /// larger of the two latency targets, expressed as time at the
    /// nominal rate. The hard threshold is conventionally ten times this.
    pub fn reset_threshold_nanos(&self, sample_rate: u32) -> i64 {
        let threshold_frames = self.midi_latency_frames().max(self.audio_latency_frames);
        (threshold_frames as f64 / sample_rate as f64 * NANOS_PER_SECOND as f64) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_48k(midi_latency_ms: u32) -> StreamConfig {
        StreamConfig {
            sample_rate: 48000,
            chunk_len_ms: 10,
            audio_latency_ms: 20,
            midi_latency_ms,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_frames_from_ms() {
        assert_eq!(frames_from_ms(10, 48000), 480);
        assert_eq!(frames_from_ms(20, 48000), 960);
        assert_eq!(frames_from_ms(0, 48000), 0);
        assert_eq!(frames_from_ms(100, 44100), 4410);
    }

    #[test]
    fn test_manual_mode_uses_configured_latency() {
        let latency = LatencyState::from_config(&config_48k(10));
        assert!(!latency.is_auto());
        assert_eq!(latency.midi_latency_frames(), 480);
        assert_eq!(latency.audio_latency_frames(), 960);
    }

    #[test]
    fn test_auto_mode_starts_at_default() {
        let latency = LatencyState::from_config(&config_48k(0));
        assert!(latency.is_auto());
        assert_eq!(
            latency.midi_latency_frames(),
            frames_from_ms(DEFAULT_AUTO_MIDI_LATENCY_MS, 48000)
        );
    }

    #[test]
    fn test_absorb_shortfall_grows_latency() {
        let latency = LatencyState::from_config(&config_48k(0));
        let before = latency.midi_latency_frames();
        let grown = latency.absorb_shortfall(100);
        assert_eq!(grown, before + 100);
        assert_eq!(latency.midi_latency_frames(), before + 100);
        // Growth never reverses.
        latency.absorb_shortfall(7);
        assert_eq!(latency.midi_latency_frames(), before + 107);
    }

    #[test]
    fn test_thresholds_update_consumed_once() {
        let latency = LatencyState::from_config(&config_48k(0));
        assert!(!latency.take_thresholds_update());
        latency.absorb_shortfall(10);
        assert!(latency.take_thresholds_update());
        assert!(!latency.take_thresholds_update());
    }

    #[test]
    fn test_reset_threshold_uses_larger_latency() {
        // audio latency (960 frames) dominates the 480-frame MIDI latency:
        // 960 frames at 48 kHz is 20 ms.
        let latency = LatencyState::from_config(&config_48k(10));
        assert_eq!(latency.reset_threshold_nanos(48000), 20_000_000);

        // Grow the MIDI latency past the audio latency and it dominates.
        let auto = LatencyState::from_config(&config_48k(0));
        auto.absorb_shortfall(48_000 - auto.midi_latency_frames());
        assert_eq!(auto.reset_threshold_nanos(48000), 1_000_000_000);
    }
}
