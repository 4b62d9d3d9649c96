//! Procedural sound effects
//!
//! Each cue is rendered from scratch on every call: oscillator or noise, an
//! optional biquad filter, and a gain envelope. The finished clip goes to
//! the mixer as an untracked effect voice, so cues overlap freely with each
//! other and with narration and cannot be stopped once fired.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

use crate::audio::{AudioClip, AudioError, DeviceManager};

/// Q des filtres (valeur par défaut d'un BiquadFilterNode)
const FILTER_Q: f32 = 1.0;

/// Fréquences de l'arpège de succès (La majeur)
const SUCCESS_NOTES: [f32; 4] = [440.0, 554.37, 659.25, 880.0];

/// Décalage entre deux notes de l'arpège (s)
const SUCCESS_STEP: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// Descending sine blip
    Click,
    /// Band-passed noise tick
    Clack,
    /// Rising filtered sawtooth sweep
    Scan,
    /// Four-note ascending arpeggio
    Success,
}

impl Cue {
    pub const ALL: [Cue; 4] = [Cue::Click, Cue::Clack, Cue::Scan, Cue::Success];

    pub fn name(self) -> &'static str {
        match self {
            Cue::Click => "click",
            Cue::Clack => "clack",
            Cue::Scan => "scan",
            Cue::Success => "success",
        }
    }

    pub fn duration(self) -> Duration {
        Duration::from_secs_f32(self.length_secs())
    }

    fn length_secs(self) -> f32 {
        match self {
            Cue::Click => 0.1,
            Cue::Clack => 0.02,
            Cue::Scan => 1.0,
            Cue::Success => 0.8,
        }
    }
}

impl fmt::Display for Cue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown cue '{0}' (expected click, clack, scan or success)")]
pub struct UnknownCue(String);

impl FromStr for Cue {
    type Err = UnknownCue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" => Ok(Cue::Click),
            "clack" | "tick" => Ok(Cue::Clack),
            "scan" | "sweep" => Ok(Cue::Scan),
            "success" | "chime" => Ok(Cue::Success),
            _ => Err(UnknownCue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Ramp {
    Set,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AutomationEvent {
    time: f32,
    value: f32,
    ramp: Ramp,
}

/// Parameter timeline in the style of an audio param: jumps and ramps,
/// each ramp running from the previous event to its own end time.
/// Events must be added in time order.
#[derive(Debug, Clone, PartialEq)]
pub struct Automation {
    events: Vec<AutomationEvent>,
}

impl Automation {
    /// Holds `value` from t = 0
    pub fn new(value: f32) -> Self {
        Self {
            events: vec![AutomationEvent {
                time: 0.0,
                value,
                ramp: Ramp::Set,
            }],
        }
    }

    pub fn set_value_at(self, value: f32, time: f32) -> Self {
        self.push(value, time, Ramp::Set)
    }

    pub fn linear_ramp_to(self, value: f32, end_time: f32) -> Self {
        self.push(value, end_time, Ramp::Linear)
    }

    /// Exponential ramp; degrades to a hold when either end is zero or the
    /// signs differ
    pub fn exponential_ramp_to(self, value: f32, end_time: f32) -> Self {
        self.push(value, end_time, Ramp::Exponential)
    }

    fn push(mut self, value: f32, time: f32, ramp: Ramp) -> Self {
        self.events.push(AutomationEvent { time, value, ramp });
        self
    }

    pub fn value_at(&self, t: f32) -> f32 {
        let Some((first, rest)) = self.events.split_first() else {
            return 0.0;
        };
        let mut prev = first;
        for event in rest {
            if event.time <= t {
                prev = event;
                continue;
            }
            let span = event.time - prev.time;
            if span <= 0.0 {
                return prev.value;
            }
            let progress = ((t - prev.time) / span).clamp(0.0, 1.0);
            return match event.ramp {
                Ramp::Set => prev.value,
                Ramp::Linear => prev.value + (event.value - prev.value) * progress,
                Ramp::Exponential => {
                    if prev.value * event.value > 0.0 {
                        prev.value * (event.value / prev.value).powf(progress)
                    } else {
                        prev.value
                    }
                }
            };
        }
        prev.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
}

impl Waveform {
    /// One period, `phase` in [0, 1), starting at zero and rising
    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (std::f32::consts::TAU * phase).sin(),
            Waveform::Triangle => {
                if phase < 0.25 {
                    4.0 * phase
                } else if phase < 0.75 {
                    2.0 - 4.0 * phase
                } else {
                    4.0 * phase - 4.0
                }
            }
            Waveform::Sawtooth => {
                if phase < 0.5 {
                    2.0 * phase
                } else {
                    2.0 * phase - 2.0
                }
            }
        }
    }
}

/// Phase-accumulating oscillator with an automated frequency
pub struct Oscillator {
    waveform: Waveform,
    frequency: Automation,
    phase: f32,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: Automation) -> Self {
        Self {
            waveform,
            frequency,
            phase: 0.0,
        }
    }

    /// Sample at time `t`, then advance one sample period
    #[inline]
    pub fn next(&mut self, t: f32, sample_rate: f32) -> f32 {
        let out = self.waveform.sample(self.phase);
        self.phase = (self.phase + self.frequency.value_at(t) / sample_rate).fract();
        out
    }
}

/// Biquad with the given response; passthrough if the parameters are
/// rejected (cutoff above Nyquist)
fn filter(kind: Type<f32>, cutoff: f32, sample_rate: f32) -> DirectForm1<f32> {
    let coeffs = Coefficients::<f32>::from_params(kind, sample_rate.hz(), cutoff.hz(), FILTER_Q)
        .unwrap_or_else(|_| {
            debug!(cutoff, sample_rate, "filter rejected, using passthrough");
            Coefficients {
                a1: 0.0,
                a2: 0.0,
                b0: 1.0,
                b1: 0.0,
                b2: 0.0,
            }
        });
    DirectForm1::<f32>::new(coeffs)
}

/// Renders `cue` as a mono clip at `sample_rate`
pub fn render_cue<R: Rng>(cue: Cue, sample_rate: u32, rng: &mut R) -> AudioClip {
    let rate = sample_rate.max(1) as f32;
    let frames = (cue.length_secs() * rate).round() as usize;
    let time = |i: usize| i as f32 / rate;

    let samples: Vec<f32> = match cue {
        Cue::Click => {
            let mut osc = Oscillator::new(
                Waveform::Sine,
                Automation::new(880.0).exponential_ramp_to(110.0, 0.1),
            );
            let gain = Automation::new(0.1).exponential_ramp_to(0.01, 0.1);
            (0..frames)
                .map(|i| {
                    let t = time(i);
                    osc.next(t, rate) * gain.value_at(t)
                })
                .collect()
        }
        Cue::Clack => {
            let mut band = filter(Type::BandPass, 1200.0, rate);
            let gain = Automation::new(0.05).exponential_ramp_to(0.001, 0.02);
            (0..frames)
                .map(|i| {
                    let noise: f32 = rng.gen_range(-1.0..1.0);
                    band.run(noise) * gain.value_at(time(i))
                })
                .collect()
        }
        Cue::Scan => {
            let mut osc = Oscillator::new(
                Waveform::Sawtooth,
                Automation::new(40.0).linear_ramp_to(800.0, 1.0),
            );
            let mut low = filter(Type::LowPass, 1000.0, rate);
            let gain = Automation::new(0.05).linear_ramp_to(0.0, 1.0);
            (0..frames)
                .map(|i| {
                    let t = time(i);
                    low.run(osc.next(t, rate)) * gain.value_at(t)
                })
                .collect()
        }
        Cue::Success => {
            let end = cue.length_secs();
            let mut out = vec![0.0f32; frames];
            for (n, &freq) in SUCCESS_NOTES.iter().enumerate() {
                let start = n as f32 * SUCCESS_STEP;
                let mut osc = Oscillator::new(Waveform::Triangle, Automation::new(freq));
                let gain = Automation::new(0.0)
                    .set_value_at(0.0, start)
                    .linear_ramp_to(0.1, start + 0.05)
                    .exponential_ramp_to(0.01, end);
                let first = (start * rate).round() as usize;
                for (i, sample) in out.iter_mut().enumerate().skip(first) {
                    let t = time(i);
                    *sample += osc.next(t, rate) * gain.value_at(t);
                }
            }
            out
        }
    };

    AudioClip::mono(sample_rate, samples)
}

/// Fires cues on the shared device
pub struct SfxGenerator {
    device: Arc<DeviceManager>,
    rng: Mutex<StdRng>,
}

impl SfxGenerator {
    pub fn new(device: Arc<DeviceManager>) -> Self {
        Self {
            device,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic noise, for tests
    pub fn with_seed(device: Arc<DeviceManager>, seed: u64) -> Self {
        Self {
            device,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Renders the cue and starts it; no handle is kept
    pub fn play(&self, cue: Cue) -> Result<(), AudioError> {
        let device = self.device.acquire()?;
        let clip = {
            let mut rng = self.rng.lock();
            render_cue(cue, device.config().sample_rate, &mut *rng)
        };
        debug!(cue = %cue, frames = clip.frames(), "sfx fired");
        device.mixer().lock().play_effect(clip);
        Ok(())
    }
}
