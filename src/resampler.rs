// === RESAMPLER AUDIO ===
// Wrapper autour de rubato pour resampling haute qualité FFT
// Utilisé quand le device refuse le 24 kHz de la narration

use rubato::{FftFixedInOut, Resampler};

use crate::audio::AudioError;

/// Taille de chunk - rubato fonctionne par blocs
const CHUNK_FRAMES: usize = 1024;

/// Resampler audio utilisant rubato (FFT-based, haute qualité)
pub struct AudioResampler {
    resampler: FftFixedInOut<f32>,
    channels: usize,
    /// Buffer d'entrée désentrelacé (un Vec par canal)
    input_buffers: Vec<Vec<f32>>,
    /// Taille de chunk d'entrée requise par rubato
    chunk_size_in: usize,
    /// Buffer d'accumulation pour les samples en attente
    pending_samples: Vec<f32>,
    /// Ratio de resampling (source_rate / target_rate)
    resample_ratio: f64,
}

impl AudioResampler {
    /// Crée un nouveau resampler
    ///
    /// # Arguments
    /// * `source_rate` - Sample rate du mixer (ex: 24000)
    /// * `target_rate` - Sample rate du device (ex: 48000)
    /// * `channels` - Nombre de canaux (1 pour la narration)
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Result<Self, AudioError> {
        let channels = channels.max(1);
        let resampler = FftFixedInOut::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| AudioError::Resampler(e.to_string()))?;

        let chunk_size_in = resampler.input_frames_max();
        let input_buffers = vec![vec![0.0f32; chunk_size_in]; channels];
        let resample_ratio = source_rate as f64 / target_rate as f64;

        tracing::debug!(
            source_rate,
            target_rate,
            channels,
            chunk_size_in,
            chunk_size_out = resampler.output_frames_max(),
            "resampler created"
        );

        Ok(Self {
            resampler,
            channels,
            input_buffers,
            chunk_size_in,
            pending_samples: Vec::with_capacity(chunk_size_in * channels * 2),
            resample_ratio,
        })
    }

    /// Frames d'entrée consommées par chunk
    pub fn input_frames(&self) -> usize {
        self.chunk_size_in
    }

    /// Frames de sortie maximum produites par chunk
    pub fn output_frames_max(&self) -> usize {
        self.resampler.output_frames_max()
    }

    /// Traite des samples entrelacés et retourne des samples resampleés
    ///
    /// L'entrée est en format entrelacé : [L0, R0, L1, R1, L2, R2, ...]
    /// La sortie est aussi entrelacée au nouveau sample rate
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.pending_samples.extend_from_slice(input);

        let samples_per_chunk = self.chunk_size_in * self.channels;
        let mut output = Vec::new();

        while self.pending_samples.len() >= samples_per_chunk {
            self.deinterleave_chunk();

            match self.resampler.process(&self.input_buffers, None) {
                Ok(resampled) => {
                    let frames_out = resampled[0].len();
                    output.reserve(frames_out * self.channels);
                    for frame in 0..frames_out {
                        for channel in resampled.iter() {
                            output.push(channel[frame]);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampler error, dropping chunk");
                }
            }

            self.pending_samples.drain(..samples_per_chunk);
        }

        output
    }

    /// Désentrelace un chunk de pending_samples vers input_buffers
    fn deinterleave_chunk(&mut self) {
        for frame in 0..self.chunk_size_in {
            for ch in 0..self.channels {
                let idx = frame * self.channels + ch;
                self.input_buffers[ch][frame] = self.pending_samples[idx];
            }
        }
    }

    /// Frames source entrées mais pas encore sorties (en attente + délai du filtre)
    pub fn latency_frames(&self) -> u64 {
        let pending = self.pending_samples.len() / self.channels;
        let delay = (self.resampler.output_delay() as f64 * self.resample_ratio).ceil() as usize;
        (pending + delay) as u64
    }

    /// Oublie tout l'audio en cours (après un flush de la sortie)
    pub fn reset(&mut self) {
        self.pending_samples.clear();
        self.resampler.reset();
    }
}
