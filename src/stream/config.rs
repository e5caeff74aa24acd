//! Stream timing configuration.
//!
//! All values are read once at stream construction; the engine never
//! writes them back. Storage and migration of settings belong to the
//! embedding application.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default sample rate when the configuration leaves it unset (44.1 kHz).
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default render chunk length in milliseconds.
pub const DEFAULT_CHUNK_LEN_MS: u32 = 30;

/// Default device buffering depth in milliseconds.
pub const DEFAULT_AUDIO_LATENCY_MS: u32 = 100;

/// Starting MIDI scheduling latency, in milliseconds, when the
/// configured value is 0 (automatic mode). Automatic mode grows the
/// latency from here as shortfalls are observed.
pub const DEFAULT_AUTO_MIDI_LATENCY_MS: u32 = 10;

/// Errors produced by [`StreamConfig::validate`] and [`StreamConfig::from_json`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The sample rate is zero, which makes every frame/time conversion
    /// meaningless.
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,
    /// The render chunk is longer than the device buffer it has to fit in.
    #[error("chunk length ({chunk_len_ms} ms) exceeds audio latency ({audio_latency_ms} ms)")]
    ChunkExceedsAudioLatency {
        chunk_len_ms: u32,
        audio_latency_ms: u32,
    },
    /// The configuration JSON could not be parsed.
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sample rate conversion quality requested from the resampling
/// collaborator. Carried in the configuration; not interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SrcQuality {
    Fastest,
    Fast,
    #[default]
    Good,
    Best,
}

/// Timing configuration for one audio stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Nominal device sample rate in frames per second.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Render chunk length in milliseconds.
    #[serde(default = "default_chunk_len_ms")]
    pub chunk_len_ms: u32,

    /// Requested device buffering depth in milliseconds.
    #[serde(default = "default_audio_latency_ms")]
    pub audio_latency_ms: u32,

    /// Requested MIDI scheduling latency in milliseconds.
    /// 0 selects automatic mode: the latency starts small and grows
    /// whenever events are observed arriving past their deadline.
    #[serde(default)]
    pub midi_latency_ms: u32,

    /// Selects the playback position model. `true` uses the internal
    /// buffer-probing estimator; `false` means the stream is driven by an
    /// external drift tracker supplied at construction.
    #[serde(default = "default_advanced_timing")]
    pub advanced_timing: bool,

    /// Resampling quality requested from the audio backend.
    #[serde(default)]
    pub src_quality: SrcQuality,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_chunk_len_ms() -> u32 {
    DEFAULT_CHUNK_LEN_MS
}

fn default_audio_latency_ms() -> u32 {
    DEFAULT_AUDIO_LATENCY_MS
}

fn default_advanced_timing() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_len_ms: DEFAULT_CHUNK_LEN_MS,
            audio_latency_ms: DEFAULT_AUDIO_LATENCY_MS,
            midi_latency_ms: 0,
            advanced_timing: true,
            src_quality: SrcQuality::Good,
        }
    }
}

impl StreamConfig {
    /// Checks the configuration for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample rate is zero or the chunk length
    /// exceeds the audio latency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.chunk_len_ms > self.audio_latency_ms {
            return Err(ConfigError::ChunkExceedsAudioLatency {
                chunk_len_ms: self.chunk_len_ms,
                audio_latency_ms: self.audio_latency_ms,
            });
        }
        Ok(())
    }

    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the parsed values
    /// fail validation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns whether automatic MIDI latency mode is selected.
    pub fn is_auto_latency(&self) -> bool {
        self.midi_latency_ms == 0
    }
}
