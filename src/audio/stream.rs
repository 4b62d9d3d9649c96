//! Audio output stream abstraction trait
//!
//! This trait abstracts the running output, allowing different backends
//! (cpal hardware output, the null clock) to be used interchangeably by the
//! device manager.

use crate::audio::error::Result;
use crate::audio::types::DeviceInfo;

/// Trait for audio output streams
///
/// A stream is created running. It pulls from the shared mixer until it is
/// suspended or dropped.
pub trait OutputStream: Send {
    /// Pauses output; the mixer clock stops advancing
    fn suspend(&mut self) -> Result<()>;

    /// Resumes output after `suspend`
    fn resume(&mut self) -> Result<()>;

    /// Returns true if the stream is pulling samples
    fn is_running(&self) -> bool;

    /// What was actually opened
    fn info(&self) -> &DeviceInfo;
}

/// Commands sent to an output thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamCommand {
    Suspend,
    Resume,
    Shutdown,
}
