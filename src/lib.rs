//! Narration and sound-effect engine for the logistics walkthrough demo.
//!
//! Speech clips are synthesized ahead of time, cached by their exact text,
//! and played one at a time on a single output device, alongside short
//! procedural cues that are generated on the fly.
//!
//! ```ignore
//! let engine = NarrationEngine::new(&EngineConfig::load())?;
//! let script = Script::bundled()?;
//! engine.preload_all(script.narrations());
//!
//! engine.play_click()?;
//! let narration = engine.play_narration(&script.intro).await?;
//! narration.finished().await;
//! ```

// === AUDIO ENGINE MODULES ===
pub mod audio;
pub mod audio_decoder;
pub mod audio_engine;
pub mod clip_cache;
pub mod mixer;
pub mod playback;
pub mod resampler;
pub mod sfx;
pub mod speech;

// === HOST SUPPORT ===
pub mod config;
pub mod logging;
pub mod script;

pub use audio::{AudioClip, AudioError, BackendKind, DeviceConfig, DeviceInfo};
pub use audio_engine::{EngineError, NarrationEngine};
pub use clip_cache::{CacheStats, PreloadStatus};
pub use config::EngineConfig;
pub use playback::{Narration, NarrationEnd, PlaybackError};
pub use script::{Script, Stage, StageKey};
pub use sfx::Cue;
pub use speech::{SpeechRequest, SpeechSynthesizer, SynthesisError};
