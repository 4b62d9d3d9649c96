//! Shared audio types used by all backends
//!
//! This module contains platform-agnostic types for the output device and
//! decoded audio. NO platform-specific imports allowed here.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sample rate of the narration output (and of the synthesized speech)
pub const NARRATION_SAMPLE_RATE: u32 = 24_000;

/// Narration is mono
pub const NARRATION_CHANNELS: u16 = 1;

/// Format the engine renders in, independent of what the hardware runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeviceConfig {
    /// The fixed narration format: 24 kHz mono
    pub const fn narration() -> Self {
        Self {
            sample_rate: NARRATION_SAMPLE_RATE,
            channels: NARRATION_CHANNELS,
        }
    }

    /// Number of frames covering `seconds` at this rate (rounded up)
    pub fn frames_for(&self, seconds: f32) -> usize {
        (seconds * self.sample_rate as f32).ceil().max(0.0) as usize
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::narration()
    }
}

/// Power state of the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Pulling samples from the mixer
    Running,
    /// Stream paused, mixer time frozen
    Suspended,
}

/// Which output backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// System default output through cpal
    #[default]
    Cpal,
    /// No hardware; rendered audio is discarded
    Null,
}

/// Information about the opened output (for logs and the host)
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Backend name ("cpal", "null")
    pub backend: &'static str,
    /// Human-readable device name
    pub name: String,
    /// Rate the hardware actually runs at
    pub hardware_sample_rate: u32,
    /// Channel count the hardware actually runs at
    pub hardware_channels: u16,
    /// True when mixer output is resampled to reach the hardware rate
    pub resampled: bool,
}

/// Decoded audio held in memory
///
/// Samples are interleaved `f32` in [-1.0, 1.0]. Cloning is cheap (the frame
/// data is shared), so the same cached clip can back any number of voices.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    channels: u16,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl AudioClip {
    /// Wraps interleaved samples. Trailing samples that do not fill a whole
    /// frame are dropped.
    pub fn new(channels: u16, sample_rate: u32, mut samples: Vec<f32>) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate(whole);
        Self {
            channels,
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Mono clip at the given rate
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(1, sample_rate, samples)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved sample data
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Natural playback length
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Sample at `frame` for `channel` (clamped to the last channel)
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let ch = channel.min(self.channels as usize - 1);
        self.samples[frame * self.channels as usize + ch]
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}
