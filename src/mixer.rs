// === MIXER ===
// Somme les voix actives dans le buffer de sortie
// Une seule voix de narration (suivie), N effets fire-and-forget (non suivis)
// Le thread de sortie appelle render() ; tout le reste ne fait que start/stop
// La fin d'une narration se mesure à l'horloge de sortie (rendu - latence), pas au rendu

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::audio::AudioClip;

/// Mixer shared between the engine and the output thread
pub type SharedMixer = Arc<Mutex<Mixer>>;

/// A clip being read out frame by frame
struct Voice {
    clip: AudioClip,
    cursor: usize,
}

impl Voice {
    fn new(clip: AudioClip) -> Self {
        Self { clip, cursor: 0 }
    }

    fn is_finished(&self) -> bool {
        self.cursor >= self.clip.frames()
    }

    /// Adds this voice into `out` (interleaved, `channels` wide)
    fn mix_into(&mut self, out: &mut [f32], channels: usize) {
        let clip_channels = self.clip.channels() as usize;
        for frame in out.chunks_exact_mut(channels) {
            if self.is_finished() {
                break;
            }
            if channels == 1 && clip_channels > 1 {
                // Downmix: moyenne des canaux
                let sum: f32 = (0..clip_channels)
                    .map(|ch| self.clip.sample(self.cursor, ch))
                    .sum();
                frame[0] += sum / clip_channels as f32;
            } else {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample += self.clip.sample(self.cursor, ch);
                }
            }
            self.cursor += 1;
        }
    }
}

/// The narration currently sounding (the only tracked voice)
struct ActiveNarration {
    id: u64,
    voice: Voice,
    /// Mixer frame at which the last sample reaches the speaker
    end_frame: u64,
    /// Fired on natural end only; dropped (never sent) on stop
    on_end: Option<oneshot::Sender<()>>,
}

/// Software mixer for one output device
pub struct Mixer {
    sample_rate: u32,
    channels: u16,
    volume: f32,
    narration: Option<ActiveNarration>,
    effects: Vec<Voice>,
    next_id: u64,
    rendered_frames: u64,
    /// Rendered frames not yet heard, as reported by the output
    output_latency: u64,
    /// Set when audible narration was cut; the output drops what it queued
    flush_requested: bool,
}

impl Mixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            volume: 1.0,
            narration: None,
            effects: Vec::new(),
            next_id: 1,
            rendered_frames: 0,
            output_latency: 0,
            flush_requested: false,
        }
    }

    pub fn shared(sample_rate: u32, channels: u16) -> SharedMixer {
        Arc::new(Mutex::new(Self::new(sample_rate, channels)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Master volume (0.0 to 1.0)
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Starts a narration voice, replacing whatever narration was sounding.
    ///
    /// The replaced voice's completion sender is dropped without firing, so
    /// its waiter observes an interruption. Returns the new playback id.
    pub fn start_narration(&mut self, clip: AudioClip, on_end: oneshot::Sender<()>) -> u64 {
        if clip.sample_rate() != self.sample_rate {
            warn!(
                clip_rate = clip.sample_rate(),
                mixer_rate = self.sample_rate,
                "narration clip rate differs from mixer rate"
            );
        }
        if let Some(previous) = self.stop_narration() {
            debug!(previous, "narration replaced");
        }

        let id = self.next_id;
        self.next_id += 1;
        let end_frame = self.rendered_frames + clip.frames() as u64;
        self.narration = Some(ActiveNarration {
            id,
            voice: Voice::new(clip),
            end_frame,
            on_end: Some(on_end),
        });
        id
    }

    /// Detaches the completion sender and silences the narration voice,
    /// including what the output already queued of it.
    /// Returns the id of the voice that was stopped, if any.
    pub fn stop_narration(&mut self) -> Option<u64> {
        self.narration.take().map(|mut active| {
            active.on_end.take();
            self.flush_requested = true;
            active.id
        })
    }

    /// True once after a stop: queued output must be dropped before the
    /// next render
    pub fn take_flush_request(&mut self) -> bool {
        std::mem::take(&mut self.flush_requested)
    }

    /// Frames that will still be queued, unheard, once the next render
    /// lands in the output (queue content plus the block itself).
    /// Zero for outputs that consume each block as it is rendered.
    pub fn set_output_latency(&mut self, frames: u64) {
        self.output_latency = frames;
    }

    /// Frames the listener has actually heard
    pub fn played_frames(&self) -> u64 {
        self.rendered_frames.saturating_sub(self.output_latency)
    }

    /// Id of the narration currently sounding (queued audio included)
    pub fn narration_id(&self) -> Option<u64> {
        self.narration.as_ref().map(|active| active.id)
    }

    pub fn is_narrating(&self) -> bool {
        self.narration.is_some()
    }

    /// Queues an untracked effect voice; effects overlap freely
    pub fn play_effect(&mut self, clip: AudioClip) {
        if clip.is_empty() {
            return;
        }
        self.effects.push(Voice::new(clip));
    }

    /// Number of effect voices still sounding
    pub fn active_effects(&self) -> usize {
        self.effects.len()
    }

    /// Renders the next block into `out` (interleaved, `channels()` wide).
    /// Any trailing partial frame is left silent.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let channels = self.channels as usize;
        let whole = out.len() - out.len() % channels;
        let out = &mut out[..whole];

        if let Some(active) = self.narration.as_mut() {
            active.voice.mix_into(out, channels);
        }
        for effect in &mut self.effects {
            effect.mix_into(out, channels);
        }
        self.effects.retain(|effect| !effect.is_finished());

        let volume = self.volume;
        for sample in out.iter_mut() {
            *sample = (*sample * volume).clamp(-1.0, 1.0);
        }
        self.rendered_frames += (whole / channels) as u64;

        // Fini seulement quand le dernier sample a été joué, pas juste rendu
        let played = self.played_frames();
        let finished = self
            .narration
            .as_ref()
            .is_some_and(|active| active.voice.is_finished() && played >= active.end_frame);
        if finished {
            if let Some(mut active) = self.narration.take() {
                debug!(playback_id = active.id, "narration reached natural end");
                if let Some(tx) = active.on_end.take() {
                    // Le receveur a pu être abandonné : pas une erreur
                    let _ = tx.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(frames: usize, value: f32) -> AudioClip {
        AudioClip::mono(24_000, vec![value; frames])
    }

    #[test]
    fn test_render_silence_when_idle() {
        let mut mixer = Mixer::new(24_000, 1);
        let mut out = [1.0f32; 16];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(mixer.played_frames(), 16);
    }

    #[test]
    fn test_narration_fires_once_on_natural_end() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx, mut rx) = oneshot::channel();
        mixer.start_narration(clip(10, 0.5), tx);

        let mut out = [0.0f32; 6];
        mixer.render(&mut out);
        assert_eq!(out, [0.5; 6]);
        assert!(rx.try_recv().is_err());
        assert!(mixer.is_narrating());

        mixer.render(&mut out);
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(&out[4..], &[0.0; 2]);
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(!mixer.is_narrating());

        // Plus rien ne sonne ensuite
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stop_detaches_completion() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx, mut rx) = oneshot::channel();
        let id = mixer.start_narration(clip(100, 0.5), tx);

        assert_eq!(mixer.stop_narration(), Some(id));
        assert_eq!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed));
        assert!(mixer.take_flush_request());
        assert!(!mixer.take_flush_request());

        // Rien à couper : pas de flush
        assert_eq!(mixer.stop_narration(), None);
        assert!(!mixer.take_flush_request());
    }

    #[test]
    fn test_completion_waits_for_queued_output() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx, mut rx) = oneshot::channel();
        let id = mixer.start_narration(clip(10, 0.5), tx);

        // Sortie bufferisée : 10 frames en file + le bloc rendu
        let mut out = [0.0f32; 6];
        mixer.set_output_latency(16);
        mixer.render(&mut out);
        mixer.render(&mut out);
        assert_eq!(mixer.played_frames(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(mixer.narration_id(), Some(id));

        mixer.set_output_latency(9);
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(mixer.played_frames(), 9);
        assert!(rx.try_recv().is_err());

        mixer.set_output_latency(6);
        mixer.render(&mut out);
        assert_eq!(mixer.played_frames(), 18);
        assert_eq!(rx.try_recv(), Ok(()));
        assert_eq!(mixer.narration_id(), None);
    }

    #[test]
    fn test_stop_while_draining_interrupts_and_flushes() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx, mut rx) = oneshot::channel();
        let id = mixer.start_narration(clip(4, 0.5), tx);

        let mut out = [0.0f32; 4];
        mixer.set_output_latency(100);
        mixer.render(&mut out);
        assert_eq!(mixer.narration_id(), Some(id));

        assert_eq!(mixer.stop_narration(), Some(id));
        assert!(mixer.take_flush_request());
        mixer.set_output_latency(0);
        mixer.render(&mut out);
        assert_eq!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed));
    }

    #[test]
    fn test_start_replaces_previous_narration() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        let a = mixer.start_narration(clip(100, 0.25), tx_a);
        let b = mixer.start_narration(clip(4, 0.75), tx_b);
        assert_ne!(a, b);
        assert_eq!(mixer.narration_id(), Some(b));
        assert!(rx_a.try_recv().is_err());

        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.75; 4]);
        assert_eq!(rx_a.try_recv(), Err(oneshot::error::TryRecvError::Closed));
        assert_eq!(rx_b.try_recv(), Ok(()));
    }

    #[test]
    fn test_effects_overlap_and_retire() {
        let mut mixer = Mixer::new(24_000, 1);
        let (tx, _rx) = oneshot::channel();
        mixer.start_narration(clip(8, 0.1), tx);
        mixer.play_effect(clip(2, 0.2));
        mixer.play_effect(clip(4, 0.3));
        assert_eq!(mixer.active_effects(), 2);

        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        assert!((out[0] - 0.6).abs() < 1e-6);
        assert!((out[3] - 0.4).abs() < 1e-6);
        assert_eq!(mixer.active_effects(), 0);
        assert!(mixer.is_narrating());
    }

    #[test]
    fn test_mono_clip_fills_every_output_channel() {
        let mut mixer = Mixer::new(24_000, 2);
        mixer.play_effect(clip(2, 0.5));
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.5; 4]);
    }

    #[test]
    fn test_stereo_clip_downmixes_to_mono() {
        let mut mixer = Mixer::new(24_000, 1);
        mixer.play_effect(AudioClip::new(2, 24_000, vec![0.2, 0.6, 0.2, 0.6]));
        let mut out = [0.0f32; 2];
        mixer.render(&mut out);
        assert!((out[0] - 0.4).abs() < 1e-6);
        assert!((out[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_volume_and_clamp() {
        let mut mixer = Mixer::new(24_000, 1);
        mixer.play_effect(clip(2, 0.9));
        mixer.play_effect(clip(2, 0.9));
        let mut out = [0.0f32; 2];
        mixer.render(&mut out);
        assert_eq!(out, [1.0, 1.0]);

        mixer.set_volume(0.5);
        mixer.play_effect(clip(1, 0.8));
        let mut out = [0.0f32; 1];
        mixer.render(&mut out);
        assert!((out[0] - 0.4).abs() < 1e-6);
        mixer.set_volume(3.0);
        assert_eq!(mixer.volume(), 1.0);
    }
}
