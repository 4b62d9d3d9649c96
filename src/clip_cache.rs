// === CLIP CACHE ===
// Texte de narration → clip décodé, plus les fetchs en cours
// Un seul fetch par texte à la fois : les appels concurrents partagent le même futur
// Un échec ne laisse aucune trace : ni clip, ni pending → le prochain appel réessaie

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audio::{AudioClip, DeviceConfig};
use crate::audio_decoder::decode_speech_payload;
use crate::config::SpeechSettings;
use crate::speech::{SpeechRequest, SpeechSynthesizer, SynthesisError};

/// In-flight fetch; resolves to true when the clip landed in the cache
pub type PendingFetch = Shared<BoxFuture<'static, bool>>;

/// What `preload` did. Informational only: every variant but `Started` is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadStatus {
    Started,
    AlreadyCached,
    AlreadyPending,
    NoProvider,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cached: usize,
    pub pending: usize,
    /// Provider calls issued since creation
    pub requests: u64,
    /// Provider calls that did not produce a clip
    pub failures: u64,
}

/// A fetch in flight, tagged so only its own cleanup can remove it
struct PendingEntry {
    id: u64,
    fetch: PendingFetch,
}

#[derive(Default)]
struct CacheState {
    clips: HashMap<String, AudioClip>,
    pending: HashMap<String, PendingEntry>,
}

struct CacheInner {
    state: Mutex<CacheState>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    runtime: Handle,
    device: DeviceConfig,
    prompt_template: String,
    voice: String,
    requests: AtomicU64,
    failures: AtomicU64,
    next_fetch_id: AtomicU64,
}

/// Narration clip cache and preload coordinator (cheap to clone)
#[derive(Clone)]
pub struct ClipCache {
    inner: Arc<CacheInner>,
}

impl ClipCache {
    /// `synthesizer` is None when no credential is configured; every
    /// preload then declines.
    pub fn new(
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        speech: &SpeechSettings,
        device: DeviceConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                synthesizer,
                runtime,
                device,
                prompt_template: speech.prompt_template.clone(),
                voice: speech.voice.clone(),
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                next_fetch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn has_provider(&self) -> bool {
        self.inner.synthesizer.is_some()
    }

    /// Starts fetching `text` unless it is cached, already in flight, or no
    /// provider is configured. Never fails; failures only show up in logs.
    pub fn preload(&self, text: &str) -> PreloadStatus {
        let mut state = self.inner.state.lock();
        if state.clips.contains_key(text) {
            return PreloadStatus::AlreadyCached;
        }
        if state.pending.contains_key(text) {
            return PreloadStatus::AlreadyPending;
        }
        let Some(synthesizer) = self.inner.synthesizer.clone() else {
            debug!(text_len = text.len(), "no speech provider, preload skipped");
            return PreloadStatus::NoProvider;
        };

        // Inséré sous le même verrou : la tâche ne peut pas se terminer avant
        let entry = self.spawn_fetch(text.to_string(), synthesizer);
        state.pending.insert(text.to_string(), entry);
        PreloadStatus::Started
    }

    pub fn is_cached(&self, text: &str) -> bool {
        self.inner.state.lock().clips.contains_key(text)
    }

    pub fn get(&self, text: &str) -> Option<AudioClip> {
        self.inner.state.lock().clips.get(text).cloned()
    }

    /// The in-flight fetch for `text`, to await alongside other callers
    pub fn pending(&self, text: &str) -> Option<PendingFetch> {
        self.inner
            .state
            .lock()
            .pending
            .get(text)
            .map(|entry| entry.fetch.clone())
    }

    /// Preloads `text` if needed and waits for the outcome
    pub async fn load(&self, text: &str) -> bool {
        self.preload(text);
        match self.pending(text) {
            Some(fetch) => fetch.await,
            None => self.is_cached(text),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            cached: state.clips.len(),
            pending: state.pending.len(),
            requests: self.inner.requests.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    fn spawn_fetch(&self, text: String, synthesizer: Arc<dyn SpeechSynthesizer>) -> PendingEntry {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let span = info_span!("synthesize", provider = synthesizer.name(), text_len = text.len());

        let task_text = text.clone();
        let task = async move {
            let mut guard = PendingGuard {
                inner: Arc::clone(&inner),
                text: Some(task_text.clone()),
                id,
            };
            let outcome = inner.fetch(&task_text, synthesizer.as_ref()).await;
            guard.text = None;
            inner.settle(task_text, outcome)
        }
        .instrument(span);

        let handle = self.inner.runtime.spawn(task);
        let inner = Arc::clone(&self.inner);
        let fetch = async move {
            match handle.await {
                Ok(cached) => cached,
                Err(e) => {
                    // Tâche annulée, ou jamais lancée si le runtime est arrêté
                    if inner.abandon(&text, id) {
                        warn!(text_len = text.len(), error = %e, "narration fetch never completed");
                    }
                    false
                }
            }
        }
        .boxed()
        .shared();

        PendingEntry { id, fetch }
    }
}

impl CacheInner {
    async fn fetch(&self, text: &str, synthesizer: &dyn SpeechSynthesizer) -> Result<AudioClip, SynthesisError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let request = SpeechRequest::narration(text, &self.prompt_template, &self.voice);
        let payload = synthesizer.synthesize(&request).await?;
        Ok(decode_speech_payload(&payload, self.device)?)
    }

    /// Drops the pending entry of fetch `id` if it is still there.
    /// Returns whether it was (and counts it as a failure).
    fn abandon(&self, text: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        if !state.pending.get(text).is_some_and(|entry| entry.id == id) {
            return false;
        }
        state.pending.remove(text);
        self.failures.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Records the outcome and clears the pending entry under one lock
    fn settle(&self, text: String, outcome: Result<AudioClip, SynthesisError>) -> bool {
        let mut state = self.state.lock();
        state.pending.remove(&text);
        match outcome {
            Ok(clip) => {
                info!(
                    text_len = text.len(),
                    duration_ms = clip.duration().as_millis() as u64,
                    "narration cached"
                );
                state.clips.insert(text, clip);
                true
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(text_len = text.len(), error = %e, "narration synthesis failed");
                false
            }
        }
    }
}

/// Removes the pending entry if the fetch task dies before settling
struct PendingGuard {
    inner: Arc<CacheInner>,
    text: Option<String>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(text) = self.text.take() {
            self.inner.abandon(&text, self.id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{GarbageSynthesizer, ScriptedSynthesizer};
    use super::*;

    fn cache_with(synth: Option<Arc<dyn SpeechSynthesizer>>) -> ClipCache {
        ClipCache::new(
            synth,
            &SpeechSettings::default(),
            DeviceConfig::narration(),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_preload_caches_clip() {
        let synth = Arc::new(ScriptedSynthesizer::new(2_400));
        let cache = cache_with(Some(synth.clone()));

        assert_eq!(cache.preload("ready"), PreloadStatus::Started);
        assert!(!cache.is_cached("ready"));
        assert!(cache.load("ready").await);
        assert!(cache.is_cached("ready"));
        assert!(cache.pending("ready").is_none());

        let clip = cache.get("ready").unwrap();
        assert_eq!(clip.sample_rate(), 24_000);
        assert_eq!(clip.frames(), 2_400);
        assert_eq!(
            synth.prompts.lock().clone(),
            vec!["Say calmly and professionally: ready".to_string()]
        );

        assert_eq!(cache.preload("ready"), PreloadStatus::AlreadyCached);
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_preloads_share_one_request() {
        let (synth, gate) = ScriptedSynthesizer::gated(100);
        let synth = Arc::new(synth);
        let cache = cache_with(Some(synth.clone()));

        assert_eq!(cache.preload("dup"), PreloadStatus::Started);
        assert_eq!(cache.preload("dup"), PreloadStatus::AlreadyPending);

        let first = cache.pending("dup").unwrap();
        let second = cache.clone();
        let waiter = tokio::spawn(async move { second.load("dup").await });

        gate.notify_one();
        assert!(first.await);
        assert!(waiter.await.unwrap());
        assert_eq!(synth.calls(), 1);
        assert_eq!(cache.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_nothing_and_retries() {
        let synth = Arc::new(ScriptedSynthesizer::new(100).failing(1));
        let cache = cache_with(Some(synth.clone()));

        assert!(!cache.load("flaky").await);
        assert!(!cache.is_cached("flaky"));
        assert!(cache.pending("flaky").is_none());

        assert_eq!(cache.preload("flaky"), PreloadStatus::Started);
        assert!(cache.load("flaky").await);
        assert!(cache.is_cached("flaky"));
        assert_eq!(synth.calls(), 2);

        let stats = cache.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_is_silent() {
        let cache = cache_with(Some(Arc::new(GarbageSynthesizer)));
        assert!(!cache.load("noise").await);
        assert!(!cache.is_cached("noise"));
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_without_provider_preload_declines() {
        let cache = cache_with(None);
        assert!(!cache.has_provider());
        assert_eq!(cache.preload("text"), PreloadStatus::NoProvider);
        assert!(cache.pending("text").is_none());
        assert!(!cache.load("text").await);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_fetch_on_stopped_runtime_is_not_stuck_pending() {
        let dead = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let handle = dead.handle().clone();
        drop(dead);

        let synth = Arc::new(ScriptedSynthesizer::new(10));
        let cache = ClipCache::new(
            Some(synth.clone()),
            &SpeechSettings::default(),
            DeviceConfig::narration(),
            handle,
        );
        let driver = tokio::runtime::Builder::new_current_thread().build().unwrap();

        assert_eq!(cache.preload("lost"), PreloadStatus::Started);
        assert!(!driver.block_on(cache.load("lost")));
        assert!(cache.pending("lost").is_none());
        assert!(!cache.is_cached("lost"));
        assert_eq!(synth.calls(), 0);
        assert_eq!(cache.stats().failures, 1);

        // Pas coincé en AlreadyPending
        assert_eq!(cache.preload("lost"), PreloadStatus::Started);
    }

    #[tokio::test]
    async fn test_keys_are_exact() {
        let synth = Arc::new(ScriptedSynthesizer::new(10));
        let cache = cache_with(Some(synth.clone()));
        assert!(cache.load("Hello").await);
        assert!(!cache.is_cached("hello"));
        assert!(!cache.is_cached("Hello "));
    }
}
