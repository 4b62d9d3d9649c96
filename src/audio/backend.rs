//! Audio backend abstraction layer
//!
//! This trait defines the interface for output backends. A backend knows how
//! to open one output stream that pulls rendered audio from a shared mixer.
//!
//! # Important
//!
//! This file must NOT contain any platform-specific imports (cpal, etc.).
//! All platform-specific code goes in the implementation files.

use crate::audio::error::Result;
use crate::audio::stream::OutputStream;
use crate::audio::types::{BackendKind, DeviceConfig};
use crate::mixer::SharedMixer;

/// Output backend trait
///
/// # Example
///
/// ```ignore
/// let backend = create_backend(BackendKind::Cpal);
/// let mixer = Mixer::shared(24_000, 1);
/// let stream = backend.open(DeviceConfig::narration(), mixer.clone())?;
/// println!("{:?}", stream.info());
/// ```
pub trait OutputBackend: Send + Sync {
    /// Opens the output and starts pulling from `mixer`.
    ///
    /// `config` is the format the mixer renders in. The backend adapts it
    /// to whatever the hardware accepts.
    fn open(&self, config: DeviceConfig, mixer: SharedMixer) -> Result<Box<dyn OutputStream>>;

    /// Get the backend name (e.g., "cpal", "null")
    fn name(&self) -> &'static str;
}

/// Factory function to create the backend selected in the configuration
pub fn create_backend(kind: BackendKind) -> Box<dyn OutputBackend> {
    match kind {
        BackendKind::Cpal => Box::new(crate::audio::cpal_stream::CpalBackend::new()),
        BackendKind::Null => Box::new(crate::audio::null_stream::NullBackend::realtime()),
    }
}
