// === PLAYBACK CONTROLLER ===
// Au plus une narration audible : tout play commence par un stop
// Chaque stop/play incrémente une époque ; une lecture différée dont l'époque
// est périmée abandonne au lieu de démarrer (un stop intervenu entre-temps gagne)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::audio::{AudioClip, AudioError, DeviceManager};
use crate::clip_cache::{ClipCache, PreloadStatus};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Device(#[from] AudioError),

    #[error("narration request superseded by a newer stop or play")]
    Superseded,

    #[error("narration audio unavailable after {attempts} fetch attempt(s)")]
    Unavailable { attempts: u32 },
}

/// How a narration left the speakers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationEnd {
    /// Played to its natural end
    Completed,
    /// Stopped or replaced
    Interrupted,
}

/// Handle on a narration that started playing
#[derive(Debug)]
pub struct Narration {
    id: u64,
    duration: Duration,
    ended: oneshot::Receiver<()>,
    outcome: Option<NarrationEnd>,
}

impl Narration {
    fn new(id: u64, duration: Duration, ended: oneshot::Receiver<()>) -> Self {
        Self {
            id,
            duration,
            ended,
            outcome: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Waits until the narration completes or is interrupted
    pub async fn finished(self) -> NarrationEnd {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        match self.ended.await {
            Ok(()) => NarrationEnd::Completed,
            Err(_) => NarrationEnd::Interrupted,
        }
    }

    /// None while still playing
    pub fn try_finished(&mut self) -> Option<NarrationEnd> {
        if self.outcome.is_none() {
            self.outcome = match self.ended.try_recv() {
                Ok(()) => Some(NarrationEnd::Completed),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(NarrationEnd::Interrupted),
            };
        }
        self.outcome
    }
}

/// Epoch a play request was issued in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayTicket(u64);

pub struct PlaybackController {
    cache: ClipCache,
    device: Arc<DeviceManager>,
    epoch: Mutex<u64>,
    max_fetch_attempts: u32,
}

impl PlaybackController {
    pub fn new(cache: ClipCache, device: Arc<DeviceManager>, max_fetch_attempts: u32) -> Self {
        Self {
            cache,
            device,
            epoch: Mutex::new(0),
            max_fetch_attempts: max_fetch_attempts.max(1),
        }
    }

    /// Silences the current narration without firing its completion.
    /// Safe to call at any time; never fails.
    pub fn stop_all(&self) {
        let mut epoch = self.epoch.lock();
        self.halt(&mut epoch);
    }

    /// Stops whatever plays and opens a new request epoch
    pub fn begin(&self) -> PlayTicket {
        let mut epoch = self.epoch.lock();
        self.halt(&mut epoch);
        PlayTicket(*epoch)
    }

    pub fn is_current(&self, ticket: PlayTicket) -> bool {
        *self.epoch.lock() == ticket.0
    }

    /// Plays `text`, loading it first if needed.
    ///
    /// A cached clip starts before this future first yields.
    pub async fn play_narration(&self, text: &str) -> Result<Narration, PlaybackError> {
        let ticket = self.begin();
        self.resolve(ticket, text).await
    }

    /// Drives a request opened with `begin`: check cache, await the pending
    /// or a new fetch, check again. At most `max_fetch_attempts` new fetches.
    pub async fn resolve(&self, ticket: PlayTicket, text: &str) -> Result<Narration, PlaybackError> {
        let mut attempts = 0u32;
        loop {
            if !self.is_current(ticket) {
                return Err(PlaybackError::Superseded);
            }
            if let Some(clip) = self.cache.get(text) {
                return self.start_if_current(ticket, clip);
            }

            let fetch = match self.cache.pending(text) {
                Some(fetch) => fetch,
                None => {
                    if attempts >= self.max_fetch_attempts {
                        warn!(text_len = text.len(), attempts, "giving up on narration");
                        return Err(PlaybackError::Unavailable { attempts });
                    }
                    match self.cache.preload(text) {
                        PreloadStatus::NoProvider => {
                            return Err(PlaybackError::Unavailable { attempts });
                        }
                        PreloadStatus::Started => attempts += 1,
                        PreloadStatus::AlreadyCached | PreloadStatus::AlreadyPending => {}
                    }
                    match self.cache.pending(text) {
                        Some(fetch) => fetch,
                        None => continue,
                    }
                }
            };

            debug!(text_len = text.len(), attempt = attempts, "waiting for narration audio");
            fetch.await;
        }
    }

    /// Callback flavour: `on_ended` runs once on natural end, never on
    /// interruption. Returns the playback id when the clip was cached and
    /// started right away.
    pub fn play_narration_then<F>(self: &Arc<Self>, text: &str, on_ended: F) -> Option<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        let ticket = self.begin();

        if let Some(clip) = self.cache.get(text) {
            return match self.start_if_current(ticket, clip) {
                Ok(narration) => {
                    let id = narration.id();
                    self.cache.runtime().spawn(notify_on_completion(narration, on_ended));
                    Some(id)
                }
                Err(e) => {
                    warn!(error = %e, "narration could not start");
                    None
                }
            };
        }

        let controller = Arc::clone(self);
        let text = text.to_string();
        self.cache.runtime().spawn(async move {
            match controller.resolve(ticket, &text).await {
                Ok(narration) => notify_on_completion(narration, on_ended).await,
                Err(PlaybackError::Superseded) => {
                    debug!(text_len = text.len(), "deferred narration superseded");
                }
                Err(e) => warn!(text_len = text.len(), error = %e, "narration not played"),
            }
        });
        None
    }

    /// Id of the narration currently audible
    pub fn current(&self) -> Option<u64> {
        self.device
            .get()
            .and_then(|device| device.mixer().lock().narration_id())
    }

    fn start_if_current(&self, ticket: PlayTicket, clip: AudioClip) -> Result<Narration, PlaybackError> {
        let device = self.device.acquire()?;

        let epoch = self.epoch.lock();
        if *epoch != ticket.0 {
            return Err(PlaybackError::Superseded);
        }
        let (tx, rx) = oneshot::channel();
        let duration = clip.duration();
        let id = device.mixer().lock().start_narration(clip, tx);
        debug!(playback_id = id, duration_ms = duration.as_millis() as u64, "narration started");
        Ok(Narration::new(id, duration, rx))
    }

    fn halt(&self, epoch: &mut u64) {
        *epoch += 1;
        // Jamais ouvert → rien ne joue
        if let Some(device) = self.device.get() {
            if let Some(id) = device.mixer().lock().stop_narration() {
                debug!(playback_id = id, "narration stopped");
            }
        }
    }
}

async fn notify_on_completion<F: FnOnce()>(narration: Narration, on_ended: F) {
    if narration.finished().await == NarrationEnd::Completed {
        on_ended();
    }
}
