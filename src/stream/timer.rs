//! The clock synchronization engine for one audio stream.
//!
//! Two threads touch this state: the rendering thread refreshes the
//! time/frame mapping after each chunk it writes to the device, and the
//! MIDI thread converts event arrival times into target frame positions.
//! Neither path blocks; the only hand-off is the double-buffered snapshot
//! exchange in [`ClockSyncState`].

use crate::clock::{now_nanos, ClockSyncState, DriftTracker, TimeSnapshot, NANOS_PER_SECOND};
use crate::stream::config::StreamConfig;
use crate::stream::latency::LatencyState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum tolerated relative deviation of the estimated sample rate
/// from the nominal one. Actual hardware rates stay well within 1%;
/// larger estimates are measurement noise, not drift.
const MAX_RATE_ERROR: f64 = 0.005;

/// State shared between the rendering and MIDI threads.
struct TimingState {
    clock: ClockSyncState,
    latency: LatencyState,
    /// Frames handed to the playback device so far. Advanced by the
    /// rendering side, only read everywhere else.
    frames_rendered: AtomicU64,
    /// Nominal device sample rate.
    sample_rate: u32,
}

/// Playback position model, fixed when the stream is created.
enum TimingMode {
    /// Extrapolate from the device buffer level and the last trusted
    /// snapshot, correcting the rate estimate as playback progresses.
    SelfEstimating,
    /// Delegate time correction and rate drift to an external tracker.
    #[allow(dead_code)]
    Tracked(Box<dyn DriftTracker>),
}

/// The write side of the clock synchronization engine.
///
/// Owned by the rendering thread. After each chunk is handed to the
/// device, the renderer calls [`add_rendered_frames`] followed by
/// [`update_position`] with the measured time and the current device
/// buffer level. [`timestamper`] hands out the read side for the MIDI
/// thread.
///
/// [`add_rendered_frames`]: StreamClock::add_rendered_frames
/// [`update_position`]: StreamClock::update_position
/// [`timestamper`]: StreamClock::timestamper
pub struct StreamClock {
    shared: Arc<TimingState>,
    mode: TimingMode,
}

impl StreamClock {
    /// Creates a self-estimating stream clock starting now.
    ///
    /// This is the model selected by `advanced_timing: true`: the played
    /// position is probed from the device buffer level and the actual
    /// sample rate is estimated from successive measurements.
    pub fn new(config: &StreamConfig) -> Self {
        Self::starting_at(config, now_nanos())
    }

    /// Creates a self-estimating stream clock anchored at `start_nanos`.
    /// Useful when the caller drives time explicitly, e.g. in simulations.
    #[allow(dead_code)]
    pub fn starting_at(config: &StreamConfig, start_nanos: i64) -> Self {
        Self::build(config, TimingMode::SelfEstimating, start_nanos)
    }

    /// Creates a stream clock driven by an external drift tracker,
    /// starting now. This is the model for `advanced_timing: false`.
    #[allow(dead_code)]
    pub fn with_drift_tracker(config: &StreamConfig, tracker: Box<dyn DriftTracker>) -> Self {
        Self::with_drift_tracker_starting_at(config, tracker, now_nanos())
    }

    /// Creates a tracker-driven stream clock anchored at `start_nanos`.
    #[allow(dead_code)]
    pub fn with_drift_tracker_starting_at(
        config: &StreamConfig,
        tracker: Box<dyn DriftTracker>,
        start_nanos: i64,
    ) -> Self {
        Self::build(config, TimingMode::Tracked(tracker), start_nanos)
    }

    fn build(config: &StreamConfig, mode: TimingMode, start_nanos: i64) -> Self {
        let initial = TimeSnapshot::initial(start_nanos, config.sample_rate as f64);
        Self {
            shared: Arc::new(TimingState {
                clock: ClockSyncState::new(initial),
                latency: LatencyState::from_config(config),
                frames_rendered: AtomicU64::new(0),
                sample_rate: config.sample_rate,
            }),
            mode,
        }
    }

    /// Returns a handle for the MIDI thread. Cheap to clone; any number
    /// of handles may coexist with the stream clock.
    pub fn timestamper(&self) -> MidiTimestamper {
        MidiTimestamper {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Records `frames` more frames as handed to the playback device.
    /// Called by the rendering side after each chunk write.
    pub fn add_rendered_frames(&self, frames: u64) {
        self.shared
            .frames_rendered
            .fetch_add(frames, Ordering::Relaxed);
    }

    /// Total frames handed to the playback device so far.
    pub fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered.load(Ordering::Relaxed)
    }

    /// Current MIDI scheduling latency in frames.
    #[allow(dead_code)]
    pub fn midi_latency_frames(&self) -> u64 {
        self.shared.latency.midi_latency_frames()
    }

    /// The currently published time/frame mapping, for diagnostics.
    pub fn snapshot(&self) -> TimeSnapshot {
        self.shared.clock.selected_snapshot()
    }

    /// Refreshes the time/frame mapping from a new measurement.
    ///
    /// # Arguments
    ///
    /// * `measured_nanos` - Monotonic time the measurement was taken
    /// * `frames_in_flight` - Frames buffered in the device but not yet
    ///   physically played (ignored in tracker-driven mode)
    ///
    /// Measurements arriving faster than one MIDI-latency period since
    /// the last accepted one are dropped: some audio backends pull more
    /// data than the configured latency in no time, and those bursts add
    /// jitter rather than signal.
    pub fn update_position(&mut self, measured_nanos: i64, frames_in_flight: u64) {
        let shared = &self.shared;
        let nominal_rate = shared.sample_rate as f64;
        let current = shared.clock.selected_snapshot();
        let midi_latency_frames = shared.latency.midi_latency_frames();

        let elapsed_nanos = measured_nanos - current.nanos;
        if (elapsed_nanos as f64 * nominal_rate)
            < (midi_latency_frames as f64 * NANOS_PER_SECOND as f64)
        {
            return;
        }

        let frames_rendered = shared.frames_rendered.load(Ordering::Relaxed);

        match &mut self.mode {
            TimingMode::Tracked(tracker) => {
                if shared.latency.take_thresholds_update() {
                    let threshold_nanos = shared.latency.reset_threshold_nanos(shared.sample_rate);
                    tracker.set_params(threshold_nanos, 10 * threshold_nanos);
                }
                let rendered_nanos =
                    (frames_rendered as f64 / nominal_rate * NANOS_PER_SECOND as f64) as i64;
                let corrected_nanos = tracker.sync(measured_nanos, rendered_nanos);
                shared.clock.publish(TimeSnapshot {
                    nanos: corrected_nanos,
                    frames: frames_rendered,
                    sample_rate: nominal_rate * tracker.drift(),
                });
            }
            TimingMode::SelfEstimating => {
                // Frames plausibly played so far, assuming no x-runs.
                let estimated_frames = frames_rendered.saturating_sub(frames_in_flight);
                let seconds_elapsed = elapsed_nanos as f64 / NANOS_PER_SECOND as f64;

                // Monotonic extrapolation from the last trusted snapshot.
                let predicted_frames =
                    current.frames + (current.sample_rate * seconds_elapsed + 0.5) as u64;

                let divergence = estimated_frames as i64 - predicted_frames as i64;
                if divergence.unsigned_abs() > midi_latency_frames {
                    // The estimation has drifted beyond recovery;
                    // re-anchor at the measurement instead of continuing
                    // to extrapolate from stale data.
                    tracing::warn!(
                        "estimated play position is way off ({} frames), resetting",
                        divergence
                    );
                    shared.clock.publish(TimeSnapshot {
                        nanos: measured_nanos,
                        frames: estimated_frames,
                        sample_rate: nominal_rate,
                    });
                    return;
                }

                let mut estimated_rate =
                    (estimated_frames as f64 - current.frames as f64) / seconds_elapsed;
                let relative_error = estimated_rate / nominal_rate;
                if relative_error < 1.0 - MAX_RATE_ERROR {
                    estimated_rate = (1.0 - MAX_RATE_ERROR) * nominal_rate;
                } else if relative_error > 1.0 + MAX_RATE_ERROR {
                    estimated_rate = (1.0 + MAX_RATE_ERROR) * nominal_rate;
                }

                shared.clock.publish(TimeSnapshot {
                    nanos: measured_nanos,
                    frames: predicted_frames,
                    sample_rate: estimated_rate,
                });
            }
        }
    }
}

/// The read side of the clock synchronization engine.
///
/// Held by the MIDI thread; converts event arrival times into target
/// frame positions. Wait-free and always returns a value: lateness is
/// absorbed by latency growth, never by rejecting the event.
#[derive(Clone)]
pub struct MidiTimestamper {
    shared: Arc<TimingState>,
}

impl MidiTimestamper {
    /// Computes the frame position at which an event arriving at
    /// `reference_nanos` (or now, if `None`) should take audible effect.
    pub fn estimate_timestamp(&self, reference_nanos: Option<i64>) -> u64 {
        let shared = &self.shared;
        let midi_nanos = reference_nanos.unwrap_or_else(now_nanos);

        let mut index = shared.clock.selected_index();
        let mut info = shared.clock.snapshot_at(index);
        if midi_nanos < info.nanos {
            // The event predates the selected snapshot: either a flip
            // raced this read or the event belongs to the previous
            // epoch. Use the other slot rather than computing a negative
            // elapsed time.
            index = 1 - index;
            info = shared.clock.snapshot_at(index);
        }

        let frame_offset =
            ((midi_nanos - info.nanos) as f64 * info.sample_rate / NANOS_PER_SECOND as f64) as i64;
        let midi_latency_frames = shared.latency.midi_latency_frames();
        let timestamp = info.frames as i64 + frame_offset + midi_latency_frames as i64;

        let frames_rendered = shared.frames_rendered.load(Ordering::Relaxed) as i64;
        let delay = timestamp - frames_rendered;
        if delay < 0 {
            // Negative delay means the timing estimate is behind the
            // rendered position and the event cannot meet its lead time.
            if shared.latency.is_auto() {
                let grown = shared.latency.absorb_shortfall((-delay) as u64);
                tracing::debug!(
                    "late event: rendered {} timestamp {} delay {}, latency grown to {} frames",
                    frames_rendered,
                    timestamp,
                    delay,
                    grown
                );
            } else {
                tracing::debug!(
                    "late event: rendered {} timestamp {} delay {}",
                    frames_rendered,
                    timestamp,
                    delay
                );
            }
        }

        timestamp.max(0) as u64
    }

    /// Current MIDI scheduling latency in frames.
    pub fn midi_latency_frames(&self) -> u64 {
        self.shared.latency.midi_latency_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SECOND: i64 = NANOS_PER_SECOND;

    fn config_48k(midi_latency_ms: u32) -> StreamConfig {
        StreamConfig {
            sample_rate: 48000,
            chunk_len_ms: 10,
            audio_latency_ms: 20,
            midi_latency_ms,
            ..StreamConfig::default()
        }
    }

    /// Drift tracker stub with externally inspectable state.
    #[derive(Default)]
    struct StubState {
        correction_nanos: i64,
        drift: f64,
        params: Option<(i64, i64)>,
        sync_calls: Vec<(i64, i64)>,
    }

    #[derive(Clone)]
    struct StubTracker(Arc<Mutex<StubState>>);

    impl StubTracker {
        fn new(correction_nanos: i64, drift: f64) -> Self {
            Self(Arc::new(Mutex::new(StubState {
                correction_nanos,
                drift,
                ..StubState::default()
            })))
        }
    }

    impl DriftTracker for StubTracker {
        fn sync(&mut self, measured_nanos: i64, rendered_nanos: i64) -> i64 {
            let mut state = self.0.lock().unwrap();
            state.sync_calls.push((measured_nanos, rendered_nanos));
            measured_nanos - state.correction_nanos
        }

        fn drift(&self) -> f64 {
            self.0.lock().unwrap().drift
        }

        fn set_params(&mut self, reset_threshold_nanos: i64, hard_reset_threshold_nanos: i64) {
            self.0.lock().unwrap().params =
                Some((reset_threshold_nanos, hard_reset_threshold_nanos));
        }
    }

    #[test]
    fn test_initial_timestamp_is_latency() {
        let clock = StreamClock::starting_at(&config_48k(10), 0);
        let timestamper = clock.timestamper();
        // 0 elapsed + 0 rendered + 480 frames of latency.
        assert_eq!(timestamper.estimate_timestamp(Some(0)), 480);
    }

    #[test]
    fn test_timestamp_extrapolates_at_estimated_rate() {
        let clock = StreamClock::starting_at(&config_48k(10), 0);
        let timestamper = clock.timestamper();
        // 10 ms after the anchor: 480 frames elapsed + 480 latency.
        assert_eq!(timestamper.estimate_timestamp(Some(10_000_000)), 960);
    }

    #[test]
    fn test_timestamp_idempotent_without_updates() {
        let clock = StreamClock::starting_at(&config_48k(10), 0);
        let timestamper = clock.timestamper();
        let first = timestamper.estimate_timestamp(Some(25_000_000));
        let second = timestamper.estimate_timestamp(Some(25_000_000));
        assert_eq!(first, second);
    }

    #[test]
    fn test_steady_playback_keeps_nominal_rate() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        clock.add_rendered_frames(48000);
        clock.update_position(SECOND, 0);

        let snapshot = clock.snapshot();
        assert_eq!(snapshot.nanos, SECOND);
        assert_eq!(snapshot.frames, 48000);
        assert!((snapshot.sample_rate - 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_throttled_within_latency_period() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        let before = clock.snapshot();
        clock.add_rendered_frames(240);
        // 5 ms elapsed is below the 10 ms MIDI latency.
        clock.update_position(5_000_000, 0);
        assert_eq!(clock.snapshot(), before);

        // A full second later the update is accepted.
        clock.add_rendered_frames(48000 - 240);
        clock.update_position(SECOND, 0);
        assert_ne!(clock.snapshot(), before);
    }

    #[test]
    fn test_divergence_at_threshold_does_not_reset() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        // Predicted: 48000. Estimated: 48480, exactly the 480-frame
        // tolerance. No reset; the rate estimate is clamped instead.
        clock.add_rendered_frames(48480);
        clock.update_position(SECOND, 0);

        let snapshot = clock.snapshot();
        assert_eq!(snapshot.frames, 48000);
        // 48480 frames/s is a 1% error, clamped to +0.5%.
        assert!((snapshot.sample_rate - 48240.0).abs() < 1e-9);
    }

    #[test]
    fn test_divergence_past_threshold_resets() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        // Estimated: 48481, one frame past the tolerance.
        clock.add_rendered_frames(48481);
        clock.update_position(SECOND, 0);

        let snapshot = clock.snapshot();
        assert_eq!(snapshot.nanos, SECOND);
        assert_eq!(snapshot.frames, 48481);
        // A reset re-anchors at exactly the nominal rate.
        assert!((snapshot.sample_rate - 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_clamped_low() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        // Estimated 47600 frames/s: -0.83% error, clamped to -0.5%.
        clock.add_rendered_frames(47600);
        clock.update_position(SECOND, 0);
        assert!((clock.snapshot().sample_rate - 47760.0).abs() < 1e-9);
    }

    #[test]
    fn test_frames_in_flight_reduce_estimated_position() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        // 48200 rendered but 200 still buffered: the played estimate is
        // 48000, matching the prediction exactly.
        clock.add_rendered_frames(48200);
        clock.update_position(SECOND, 200);

        let snapshot = clock.snapshot();
        assert_eq!(snapshot.frames, 48000);
        assert!((snapshot.sample_rate - 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_published_frames_monotonic_under_jitter() {
        let mut clock = StreamClock::starting_at(&config_48k(10), 0);
        let jitter = [30i64, -40, 25, -10, 50, -35, 0, 15];
        let mut last_frames = 0u64;
        for (i, offset) in jitter.iter().enumerate() {
            let chunk = (1440 + offset) as u64;
            clock.add_rendered_frames(chunk);
            clock.update_position((i as i64 + 1) * 30_000_000, 100);
            let frames = clock.snapshot().frames;
            assert!(frames >= last_frames);
            last_frames = frames;
        }
    }

    #[test]
    fn test_auto_latency_absorbs_shortfall_exactly() {
        // Configured MIDI latency 0 selects automatic mode; at 48 kHz the
        // default start is 480 frames.
        let clock = StreamClock::starting_at(&config_48k(0), 0);
        let timestamper = clock.timestamper();
        let before = timestamper.midi_latency_frames();
        assert_eq!(before, 480);

        // Timestamp computes to 480 while 580 frames are already
        // rendered: a delay of -100.
        clock.add_rendered_frames(580);
        timestamper.estimate_timestamp(Some(0));
        assert_eq!(timestamper.midi_latency_frames(), before + 100);
    }

    #[test]
    fn test_manual_latency_never_grows() {
        let clock = StreamClock::starting_at(&config_48k(10), 0);
        let timestamper = clock.timestamper();
        clock.add_rendered_frames(10_000);
        timestamper.estimate_timestamp(Some(0));
        assert_eq!(timestamper.midi_latency_frames(), 480);
    }

    #[test]
    fn test_late_reference_uses_previous_epoch() {
        let mut clock = StreamClock::starting_at(&config_48k(10), SECOND);
        clock.add_rendered_frames(48000);
        clock.update_position(2 * SECOND, 0);

        // The reference predates the freshly published snapshot, so the
        // previous anchor (1 s, frame 0) applies: 24000 elapsed frames
        // plus 480 latency.
        let timestamper = clock.timestamper();
        assert_eq!(
            timestamper.estimate_timestamp(Some(SECOND + SECOND / 2)),
            24480
        );
    }

    #[test]
    fn test_timestamp_never_negative() {
        let clock = StreamClock::starting_at(&config_48k(10), 10 * SECOND);
        let timestamper = clock.timestamper();
        // A reference far before both anchors yields a negative raw
        // position; the result saturates at frame zero.
        assert_eq!(timestamper.estimate_timestamp(Some(0)), 0);
    }

    #[test]
    fn test_tracked_mode_uses_corrected_instant_and_drift() {
        let stub = StubTracker::new(5_000_000, 1.001);
        let mut clock = StreamClock::with_drift_tracker_starting_at(
            &config_48k(10),
            Box::new(stub.clone()),
            0,
        );
        clock.add_rendered_frames(48000);
        clock.update_position(SECOND, 0);

        let snapshot = clock.snapshot();
        assert_eq!(snapshot.nanos, SECOND - 5_000_000);
        assert_eq!(snapshot.frames, 48000);
        assert!((snapshot.sample_rate - 48000.0 * 1.001).abs() < 1e-6);

        // The tracker saw the rendered position expressed as time.
        let state = stub.0.lock().unwrap();
        assert_eq!(state.sync_calls, vec![(SECOND, SECOND)]);
    }

    #[test]
    fn test_latency_growth_propagates_thresholds_to_tracker() {
        let stub = StubTracker::new(0, 1.0);
        let mut clock = StreamClock::with_drift_tracker_starting_at(
            &config_48k(0),
            Box::new(stub.clone()),
            0,
        );
        let timestamper = clock.timestamper();

        // Force a 47520-frame shortfall; the auto latency grows from 480
        // to 48000 frames, which now dominates the audio latency.
        clock.add_rendered_frames(48000);
        timestamper.estimate_timestamp(Some(0));
        assert_eq!(timestamper.midi_latency_frames(), 48000);

        clock.update_position(2 * SECOND, 0);
        let state = stub.0.lock().unwrap();
        // 48000 frames at 48 kHz is one second; hard threshold is 10x.
        assert_eq!(state.params, Some((SECOND, 10 * SECOND)));
    }
}
