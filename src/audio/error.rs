//! Audio device error types
//!
//! Every backend maps its platform failures onto these variants. A device
//! error is fatal for the operation that needed the device; nothing in the
//! engine retries device creation on its own.

use thiserror::Error;

/// Unified error type for audio device operations
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    /// The platform has no output device to give us
    #[error("no audio output device available")]
    NoDevice,
    /// Querying the device configuration failed
    #[error("failed to query device configuration: {0}")]
    DeviceConfig(String),
    /// The device only speaks a sample format we cannot write
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    /// Stream creation failed
    #[error("stream creation failed: {0}")]
    StreamCreationFailed(String),
    /// Play/pause on an existing stream failed
    #[error("stream control failed: {0}")]
    StreamControl(String),
    /// The output thread exited (or never reported back)
    #[error("audio output thread is not running")]
    ThreadGone,
    /// Resampler construction failed
    #[error("resampler error: {0}")]
    Resampler(String),
}

/// Result type alias for audio device operations
pub type Result<T> = std::result::Result<T, AudioError>;
