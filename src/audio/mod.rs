//! Audio output layer for the narrator
//!
//! This module owns the single output device. Everything above it (the
//! playback controller, the SFX generator) only ever sees the mixer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        NarrationEngine (audio_engine)        │
//! │  Uses DeviceManager, doesn't know which     │
//! │  backend implementation is used             │
//! └─────────────┬───────────────────────────────┘
//!               │ acquire()
//!               ▼
//! ┌─────────────────────────────────────────────┐
//! │         trait OutputBackend                  │
//! │  open(config, mixer) -> OutputStream         │
//! └──────┬──────────────────────┬───────────────┘
//!        ▼                      ▼
//! ┌──────────────┐    ┌──────────────┐
//! │ cpal         │    │ null         │
//! │ (hardware)   │    │ (headless)   │
//! └──────────────┘    └──────────────┘
//! ```

pub mod backend;
pub mod cpal_stream;
pub mod device;
pub mod error;
pub mod null_stream;
pub mod stream;
pub mod types;

// Re-exports for convenience
pub use backend::{create_backend, OutputBackend};
pub use device::{AudioDevice, DeviceManager};
pub use error::{AudioError, Result};
pub use null_stream::NullBackend;
pub use stream::OutputStream;
pub use types::*;
