//! Contract for the external drift tracking collaborator.

/// Correlates the master clock with a rendered-time estimate and reports
/// how far the device's true rate has drifted from nominal.
///
/// Implementations are owned by the rendering thread and called after
/// each accepted position update, so `sync` must complete in bounded,
/// short time. This crate only consumes the contract; the estimation
/// algorithm behind it lives with the implementor.
pub trait DriftTracker: Send {
    /// Correlates `measured_nanos` (the master clock reading for the
    /// measurement) with `rendered_nanos` (the stream position expressed
    /// as time) and returns the corrected master-clock instant to anchor
    /// the next snapshot at.
    fn sync(&mut self, measured_nanos: i64, rendered_nanos: i64) -> i64;

    /// Returns the current drift ratio. 1.0 means the device runs at its
    /// nominal rate; the estimated actual rate is `nominal * drift()`.
    fn drift(&self) -> f64;

    /// Updates the tracker's reset thresholds, both in nanoseconds.
    /// Crossing `reset_threshold_nanos` should schedule a re-anchor;
    /// `hard_reset_threshold_nanos` bounds how long the tracker may
    /// accumulate before re-anchoring regardless.
    fn set_params(&mut self, reset_threshold_nanos: i64, hard_reset_threshold_nanos: i64);
}
