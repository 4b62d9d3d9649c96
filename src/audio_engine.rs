// === NARRATION ENGINE ===
// Façade injectée dans l'hôte : un device, un cache, un contrôleur, les SFX
// Construit une fois au démarrage, jamais détruit (vit autant que le process)

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::audio::{create_backend, AudioError, DeviceConfig, DeviceInfo, DeviceManager, OutputBackend};
use crate::clip_cache::{CacheStats, ClipCache, PreloadStatus};
use crate::config::EngineConfig;
use crate::playback::{Narration, PlaybackController, PlaybackError};
use crate::sfx::{Cue, SfxGenerator};
use crate::speech::{GeminiSpeechProvider, SpeechSynthesizer};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the narration engine must be created inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Audio(#[from] AudioError),
}

struct EngineInner {
    device: Arc<DeviceManager>,
    cache: ClipCache,
    playback: Arc<PlaybackController>,
    sfx: SfxGenerator,
}

/// Narration and sound-effect engine (cheap to clone)
#[derive(Clone)]
pub struct NarrationEngine {
    inner: Arc<EngineInner>,
}

impl NarrationEngine {
    /// Builds the engine from configuration. Nothing is opened yet: the
    /// device opens on first use, synthesis starts on first preload.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let backend = create_backend(config.output.backend);
        let synthesizer = GeminiSpeechProvider::from_config(&config.speech)
            .map(|provider| Arc::new(provider) as Arc<dyn SpeechSynthesizer>);
        if synthesizer.is_none() {
            info!("no speech credential configured, narration preloads are disabled");
        }
        Ok(Self::with_parts(backend, synthesizer, config, runtime))
    }

    /// Assembles the engine from explicit parts
    pub fn with_parts(
        backend: Box<dyn OutputBackend>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        config: &EngineConfig,
        runtime: Handle,
    ) -> Self {
        let device_config = DeviceConfig::narration();
        let device = Arc::new(DeviceManager::new(backend, device_config));
        device.set_volume(config.output.volume);

        let cache = ClipCache::new(synthesizer, &config.speech, device_config, runtime);
        let playback = Arc::new(PlaybackController::new(
            cache.clone(),
            device.clone(),
            config.playback.max_fetch_attempts,
        ));
        let sfx = SfxGenerator::new(device.clone());

        Self {
            inner: Arc::new(EngineInner {
                device,
                cache,
                playback,
                sfx,
            }),
        }
    }

    /// Opens (or wakes) the output device
    pub fn acquire_device(&self) -> Result<DeviceInfo, EngineError> {
        Ok(self.inner.device.acquire()?.info().clone())
    }

    /// The opened device, if any
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.device.get().map(|device| device.info().clone())
    }

    pub fn has_provider(&self) -> bool {
        self.inner.cache.has_provider()
    }

    pub fn preload(&self, text: &str) -> PreloadStatus {
        self.inner.cache.preload(text)
    }

    /// Preloads every text; returns how many fetches were started
    pub fn preload_all<'a, I>(&self, texts: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let started = texts
            .into_iter()
            .filter(|text| self.inner.cache.preload(text) == PreloadStatus::Started)
            .count();
        info!(started, "narration preload requested");
        started
    }

    pub fn is_cached(&self, text: &str) -> bool {
        self.inner.cache.is_cached(text)
    }

    /// Waits for `text` to finish loading (preloading it if needed)
    pub async fn wait_cached(&self, text: &str) -> bool {
        self.inner.cache.load(text).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub async fn play_narration(&self, text: &str) -> Result<Narration, PlaybackError> {
        self.inner.playback.play_narration(text).await
    }

    /// `on_ended` runs once if the narration reaches its natural end
    pub fn play_narration_then<F>(&self, text: &str, on_ended: F) -> Option<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.playback.play_narration_then(text, on_ended)
    }

    pub fn stop_all(&self) {
        self.inner.playback.stop_all();
    }

    /// Id of the narration currently audible
    pub fn current_narration(&self) -> Option<u64> {
        self.inner.playback.current()
    }

    pub fn play_cue(&self, cue: Cue) -> Result<(), AudioError> {
        self.inner.sfx.play(cue)
    }

    pub fn play_click(&self) -> Result<(), AudioError> {
        self.play_cue(Cue::Click)
    }

    pub fn play_clack(&self) -> Result<(), AudioError> {
        self.play_cue(Cue::Clack)
    }

    pub fn play_scan(&self) -> Result<(), AudioError> {
        self.play_cue(Cue::Scan)
    }

    pub fn play_success(&self) -> Result<(), AudioError> {
        self.play_cue(Cue::Success)
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner.device.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.inner.device.volume()
    }

    /// Pauses the device if it is open; the next use wakes it
    pub fn suspend(&self) -> Result<(), AudioError> {
        match self.inner.device.get() {
            Some(device) => device.suspend(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceState, NullBackend};
    use crate::clip_cache::test_support::ScriptedSynthesizer;
    use crate::playback::NarrationEnd;

    fn engine(synth: Option<Arc<dyn SpeechSynthesizer>>) -> NarrationEngine {
        NarrationEngine::with_parts(
            Box::new(NullBackend::manual()),
            synth,
            &EngineConfig::default(),
            Handle::current(),
        )
    }

    fn render(engine: &NarrationEngine, frames: usize) {
        let device = engine.inner.device.acquire().unwrap();
        let mut buf = vec![0.0f32; frames];
        device.mixer().lock().render(&mut buf);
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            NarrationEngine::new(&EngineConfig::default()),
            Err(EngineError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_new_without_credential_declines_preloads() {
        let mut config = EngineConfig::default();
        config.output.backend = crate::audio::BackendKind::Null;
        let engine = NarrationEngine::new(&config).unwrap();
        assert!(!engine.has_provider());
        assert_eq!(engine.preload("hello"), PreloadStatus::NoProvider);
        assert!(engine.device_info().is_none());
    }

    #[tokio::test]
    async fn test_preload_all_then_play() {
        let synth = Arc::new(ScriptedSynthesizer::new(240));
        let engine = engine(Some(synth.clone()));
        let texts = ["intro", "stage", "intro"];

        assert_eq!(engine.preload_all(texts), 2);
        assert!(engine.wait_cached("intro").await);
        assert!(engine.wait_cached("stage").await);
        assert_eq!(synth.calls(), 2);
        assert_eq!(engine.cache_stats().cached, 2);

        let narration = engine.play_narration("intro").await.unwrap();
        assert_eq!(engine.current_narration(), Some(narration.id()));
        render(&engine, 240);
        assert_eq!(narration.finished().await, NarrationEnd::Completed);
        assert_eq!(engine.current_narration(), None);
    }

    #[tokio::test]
    async fn test_cues_overlap_narration() {
        let synth = Arc::new(ScriptedSynthesizer::new(24_000));
        let engine = engine(Some(synth));
        assert!(engine.wait_cached("long").await);

        let _narration = engine.play_narration("long").await.unwrap();
        engine.play_click().unwrap();
        engine.play_scan().unwrap();
        engine.play_clack().unwrap();
        engine.play_success().unwrap();

        let device = engine.inner.device.get().unwrap();
        assert_eq!(device.mixer().lock().active_effects(), 4);
        assert!(engine.current_narration().is_some());

        engine.stop_all();
        assert!(engine.current_narration().is_none());
        assert_eq!(device.mixer().lock().active_effects(), 4);
    }

    #[tokio::test]
    async fn test_volume_and_suspend() {
        let engine = engine(None);
        engine.set_volume(0.3);
        assert!(engine.suspend().is_ok());

        let info = engine.acquire_device().unwrap();
        assert_eq!(info.backend, "null");
        assert_eq!(engine.volume(), 0.3);

        engine.suspend().unwrap();
        let device = engine.inner.device.get().unwrap();
        assert_eq!(device.state(), DeviceState::Suspended);
        engine.acquire_device().unwrap();
        assert_eq!(device.state(), DeviceState::Running);
    }
}
