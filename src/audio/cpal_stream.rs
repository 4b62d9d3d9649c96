// === CPAL OUTPUT ===
// Architecture : [Mixer] → [Resampler?] → [RingBuffer] → [Callback cpal]
// Le thread de sortie possède le cpal::Stream (pas Send sur toutes les plateformes)
// Le callback audio fait UNIQUEMENT : try_pop() + conversion de format (+ flush sur stop)
// Le mixer compte comme "joué" ce qui a quitté le RingBuffer, pas ce qui y est entré

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use crate::audio::error::{AudioError, Result};
use crate::audio::stream::{OutputStream, StreamCommand};
use crate::audio::types::{DeviceConfig, DeviceInfo};
use crate::audio::OutputBackend;
use crate::mixer::SharedMixer;
use crate::resampler::AudioResampler;

/// Frames rendered per pump when no resampling is needed (~10ms at 24 kHz)
const BLOCK_FRAMES: usize = 256;

/// Taille du RingBuffer en secondes
/// Court exprès : un stop doit se faire entendre tout de suite
const RING_BUFFER_SECONDS: f32 = 0.1;

/// Intervalle de remplissage du RingBuffer
const FILL_INTERVAL: Duration = Duration::from_millis(5);

/// Backend ouvrant la sortie par défaut du système via cpal
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CpalBackend {
    fn open(&self, config: DeviceConfig, mixer: SharedMixer) -> Result<Box<dyn OutputStream>> {
        let (command_tx, command_rx) = bounded::<StreamCommand>(8);
        let (ready_tx, ready_rx) = bounded::<Result<DeviceInfo>>(1);

        thread::Builder::new()
            .name("narrator-output".to_string())
            .spawn(move || output_thread_main(config, mixer, command_rx, ready_tx))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let info = ready_rx.recv().map_err(|_| AudioError::ThreadGone)??;
        info!(
            device = %info.name,
            hardware_rate = info.hardware_sample_rate,
            hardware_channels = info.hardware_channels,
            resampled = info.resampled,
            "audio output opened"
        );

        Ok(Box::new(CpalStream {
            info,
            running: true,
            command_tx,
        }))
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

/// Handle vers le thread de sortie
pub struct CpalStream {
    info: DeviceInfo,
    running: bool,
    command_tx: Sender<StreamCommand>,
}

impl OutputStream for CpalStream {
    fn suspend(&mut self) -> Result<()> {
        self.command_tx
            .send(StreamCommand::Suspend)
            .map_err(|_| AudioError::ThreadGone)?;
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.command_tx
            .send(StreamCommand::Resume)
            .map_err(|_| AudioError::ThreadGone)?;
        self.running = true;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.command_tx.send(StreamCommand::Shutdown);
    }
}

/// Everything the output thread owns once the device is open
struct OpenedOutput {
    stream: cpal::Stream,
    producer: HeapProd<f32>,
    pump: OutputPump,
    flush: Arc<AtomicBool>,
    info: DeviceInfo,
}

fn output_thread_main(
    config: DeviceConfig,
    mixer: SharedMixer,
    commands: Receiver<StreamCommand>,
    ready: Sender<Result<DeviceInfo>>,
) {
    let OpenedOutput {
        stream,
        mut producer,
        mut pump,
        flush,
        info,
    } = match open_output(config) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(AudioError::StreamControl(e.to_string())));
        return;
    }
    if ready.send(Ok(info)).is_err() {
        return;
    }

    let mut running = true;
    loop {
        match commands.recv_timeout(FILL_INTERVAL) {
            Ok(StreamCommand::Suspend) => {
                if let Err(e) = stream.pause() {
                    warn!(error = %e, "failed to pause output stream");
                }
                running = false;
            }
            Ok(StreamCommand::Resume) => {
                if let Err(e) = stream.play() {
                    warn!(error = %e, "failed to resume output stream");
                }
                running = true;
            }
            Ok(StreamCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        // Flush en attente : le callback n'a pas encore vidé le ring
        if running && !flush.load(Ordering::Acquire) {
            while producer.vacant_len() >= pump.max_output_len() {
                if !pump.pump(&mixer, &mut producer, &flush) {
                    break;
                }
            }
        }
    }

    let _ = stream.pause();
    debug!("audio output thread stopped");
}

fn open_output(config: DeviceConfig) -> Result<OpenedOutput> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = select_config(&device, config.sample_rate)?;
    let hardware_rate = supported.sample_rate().0;
    let hardware_channels = supported.channels();
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();

    let pump = OutputPump::new(config, hardware_rate, hardware_channels)?;

    let ring_len = ((hardware_rate as f32 * RING_BUFFER_SECONDS) as usize
        * hardware_channels as usize)
        .max(pump.max_output_len() * 2);
    let (producer, consumer) = HeapRb::<f32>::new(ring_len).split();
    let flush = Arc::new(AtomicBool::new(false));

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, consumer, flush.clone())?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, consumer, flush.clone())?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, consumer, flush.clone())?,
        format => return Err(AudioError::UnsupportedFormat(format!("{:?}", format))),
    };

    let info = DeviceInfo {
        backend: "cpal",
        name,
        hardware_sample_rate: hardware_rate,
        hardware_channels,
        resampled: pump.is_resampling(),
    };

    Ok(OpenedOutput {
        stream,
        producer,
        pump,
        flush,
        info,
    })
}

/// Picks the device config: the requested rate when the device offers it,
/// otherwise the device default (and the pump resamples).
fn select_config(device: &cpal::Device, rate: u32) -> Result<cpal::SupportedStreamConfig> {
    let default = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceConfig(e.to_string()))?;
    if default.sample_rate().0 == rate {
        return Ok(default);
    }

    let wanted = cpal::SampleRate(rate);
    match device.supported_output_configs() {
        Ok(ranges) => {
            let mut candidates: Vec<_> = ranges
                .filter(|range| range.min_sample_rate() <= wanted && wanted <= range.max_sample_rate())
                .filter(|range| {
                    matches!(
                        range.sample_format(),
                        cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
                    )
                })
                .collect();
            candidates.sort_by_key(|range| {
                (
                    range.sample_format() != default.sample_format(),
                    range.channels() != default.channels(),
                )
            });
            if let Some(range) = candidates.into_iter().next() {
                return Ok(range.with_sample_rate(wanted));
            }
        }
        Err(e) => warn!(error = %e, "failed to list supported output configs"),
    }

    debug!(
        requested = rate,
        default_rate = default.sample_rate().0,
        "device does not offer the narration rate, resampling"
    );
    Ok(default)
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<f32>,
    flush: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                apply_flush(&flush, &mut consumer);
                for sample in data.iter_mut() {
                    *sample = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                }
            },
            move |err| {
                error!(error = %err, "audio output error");
            },
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Drops everything queued when the pump asked for it (consumer side)
fn apply_flush(flush: &AtomicBool, consumer: &mut HeapCons<f32>) {
    if flush.load(Ordering::Acquire) {
        consumer.clear();
        flush.store(false, Ordering::Release);
    }
}

/// Renders mixer blocks and adapts them to the hardware format
struct OutputPump {
    mix_channels: usize,
    hardware_channels: usize,
    /// Mixer frames per hardware frame
    rate_ratio: f64,
    block_frames: usize,
    resampler: Option<AudioResampler>,
    mix_buf: Vec<f32>,
    out_buf: Vec<f32>,
}

impl OutputPump {
    fn new(config: DeviceConfig, hardware_rate: u32, hardware_channels: u16) -> Result<Self> {
        let mix_channels = config.channels.max(1) as usize;
        let resampler = if hardware_rate != config.sample_rate {
            Some(AudioResampler::new(config.sample_rate, hardware_rate, mix_channels)?)
        } else {
            None
        };
        let block_frames = resampler
            .as_ref()
            .map(|r| r.input_frames())
            .unwrap_or(BLOCK_FRAMES);

        Ok(Self {
            mix_channels,
            hardware_channels: hardware_channels.max(1) as usize,
            rate_ratio: config.sample_rate as f64 / hardware_rate.max(1) as f64,
            block_frames,
            resampler,
            mix_buf: vec![0.0; block_frames * mix_channels],
            out_buf: Vec::new(),
        })
    }

    fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Upper bound of samples a single `pump` pushes
    fn max_output_len(&self) -> usize {
        let frames = self
            .resampler
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(self.block_frames);
        frames * self.hardware_channels
    }

    /// Mixer frames still unheard once the next block is queued: ring
    /// content, resampler backlog and the block itself
    fn queued_frames(&self, ring_samples: usize) -> u64 {
        let hardware_frames = (ring_samples / self.hardware_channels) as f64;
        let ring = (hardware_frames * self.rate_ratio).ceil() as u64;
        let resampler = self.resampler.as_ref().map_or(0, |r| r.latency_frames());
        ring + resampler + self.block_frames as u64
    }

    /// Renders one block into the ring. Returns false without rendering
    /// when a stop asked for the queued audio to be dropped first.
    fn pump(&mut self, mixer: &SharedMixer, producer: &mut HeapProd<f32>, flush: &AtomicBool) -> bool {
        {
            // Même verrou pour le flush et le rendu : rien de nouveau ne part avant le vidage
            let mut mixer = mixer.lock();
            if mixer.take_flush_request() {
                if let Some(resampler) = self.resampler.as_mut() {
                    resampler.reset();
                }
                flush.store(true, Ordering::Release);
                return false;
            }
            mixer.set_output_latency(self.queued_frames(producer.occupied_len()));
            mixer.render(&mut self.mix_buf);
        }

        self.out_buf.clear();
        match self.resampler.as_mut() {
            Some(resampler) => {
                let resampled = resampler.process(&self.mix_buf);
                spread_channels(&resampled, self.mix_channels, &mut self.out_buf, self.hardware_channels);
            }
            None => {
                spread_channels(&self.mix_buf, self.mix_channels, &mut self.out_buf, self.hardware_channels);
            }
        }

        let pushed = producer.push_slice(&self.out_buf);
        if pushed < self.out_buf.len() {
            warn!(dropped = self.out_buf.len() - pushed, "output ring overflow");
        }
        true
    }
}

/// Maps interleaved `input` (`in_channels` wide) onto `out_channels`.
/// Mono fans out to every channel; multi-channel to mono averages.
fn spread_channels(input: &[f32], in_channels: usize, out: &mut Vec<f32>, out_channels: usize) {
    if in_channels == out_channels {
        out.extend_from_slice(input);
        return;
    }
    for frame in input.chunks_exact(in_channels) {
        if out_channels == 1 {
            out.push(frame.iter().sum::<f32>() / in_channels as f32);
        } else {
            for ch in 0..out_channels {
                out.push(frame[ch.min(in_channels - 1)]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_mono_to_stereo() {
        let mut out = Vec::new();
        spread_channels(&[0.1, 0.2], 1, &mut out, 2);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_spread_stereo_to_mono() {
        let mut out = Vec::new();
        spread_channels(&[0.2, 0.4, -0.2, -0.4], 2, &mut out, 1);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_pump_without_resampling() {
        let pump = OutputPump::new(DeviceConfig::narration(), 24_000, 2).unwrap();
        assert!(!pump.is_resampling());
        assert_eq!(pump.max_output_len(), BLOCK_FRAMES * 2);
    }

    #[test]
    fn test_pump_fills_ring() {
        let mixer = crate::mixer::Mixer::shared(24_000, 1);
        mixer
            .lock()
            .play_effect(crate::audio::AudioClip::mono(24_000, vec![0.5; BLOCK_FRAMES]));
        let mut pump = OutputPump::new(DeviceConfig::narration(), 24_000, 2).unwrap();
        let (mut producer, mut consumer) = HeapRb::<f32>::new(BLOCK_FRAMES * 4).split();
        let flush = AtomicBool::new(false);

        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert_eq!(consumer.occupied_len(), BLOCK_FRAMES * 2);
        assert_eq!(consumer.try_pop(), Some(0.5));
    }

    #[test]
    fn test_completion_waits_for_ring_to_drain() {
        let mixer = crate::mixer::Mixer::shared(24_000, 1);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        mixer
            .lock()
            .start_narration(crate::audio::AudioClip::mono(24_000, vec![0.5; 50]), tx);
        let mut pump = OutputPump::new(DeviceConfig::narration(), 24_000, 2).unwrap();
        let (mut producer, mut consumer) = HeapRb::<f32>::new(BLOCK_FRAMES * 8).split();
        let flush = AtomicBool::new(false);

        // Clip entièrement rendu, mais rien n'est sorti du ring
        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert!(rx.try_recv().is_err());
        assert!(mixer.lock().is_narrating());

        // Le callback consomme tout : la fin est entendue
        consumer.clear();
        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(!mixer.lock().is_narrating());
    }

    #[test]
    fn test_stop_flushes_queued_narration() {
        let mixer = crate::mixer::Mixer::shared(24_000, 1);
        let (tx, _rx) = tokio::sync::oneshot::channel();
        mixer
            .lock()
            .start_narration(crate::audio::AudioClip::mono(24_000, vec![0.5; 4_800]), tx);
        let mut pump = OutputPump::new(DeviceConfig::narration(), 24_000, 2).unwrap();
        let (mut producer, mut consumer) = HeapRb::<f32>::new(BLOCK_FRAMES * 8).split();
        let flush = AtomicBool::new(false);

        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert_eq!(consumer.occupied_len(), BLOCK_FRAMES * 2 * 2);

        mixer.lock().stop_narration();
        assert!(!pump.pump(&mixer, &mut producer, &flush));
        assert!(flush.load(Ordering::Acquire));

        apply_flush(&flush, &mut consumer);
        assert_eq!(consumer.occupied_len(), 0);
        assert!(!flush.load(Ordering::Acquire));

        // Après le vidage : du silence, plus de narration
        assert!(pump.pump(&mixer, &mut producer, &flush));
        assert_eq!(consumer.try_pop(), Some(0.0));
    }

    #[test]
    fn test_pump_with_resampling() {
        let pump = OutputPump::new(DeviceConfig::narration(), 48_000, 2).unwrap();
        assert!(pump.is_resampling());
        assert!(pump.max_output_len() >= pump.block_frames * 2 * 2);
    }
}
