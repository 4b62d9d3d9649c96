// === AUDIO DECODER ===
// Décode la réponse du fournisseur de synthèse vocale
// base64 → octets PCM 16 bits little-endian → AudioClip f32 au format du device

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

use crate::audio::{AudioClip, DeviceConfig};

/// Échelle int16 → f32 (même convention que le navigateur : / 32768)
const PCM16_SCALE: f32 = 32768.0;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("audio payload is empty")]
    Empty,

    #[error("PCM16 payload has an odd byte count ({len})")]
    OddLength { len: usize },
}

/// Decodes a standard base64 string, ignoring surrounding whitespace
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let bytes = STANDARD.decode(payload.trim())?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(bytes)
}

/// Interprets raw bytes as interleaved signed 16-bit little-endian PCM.
///
/// Samples that do not complete a frame are dropped.
pub fn decode_pcm16le(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioClip, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength { len: bytes.len() });
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect();

    Ok(AudioClip::new(channels, sample_rate, samples))
}

/// Full pipeline for a synthesized narration payload
pub fn decode_speech_payload(payload: &str, config: DeviceConfig) -> Result<AudioClip, DecodeError> {
    let bytes = decode_base64(payload)?;
    let clip = decode_pcm16le(&bytes, config.sample_rate, config.channels)?;
    if clip.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(clip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_pcm16_scaling() {
        let clip = decode_pcm16le(&pcm(&[0, 16384, -32768, 32767]), 24_000, 1).unwrap();
        assert_eq!(clip.frames(), 4);
        assert_eq!(clip.samples()[0], 0.0);
        assert_eq!(clip.samples()[1], 0.5);
        assert_eq!(clip.samples()[2], -1.0);
        assert!(clip.samples()[3] < 1.0);
    }

    #[test]
    fn test_speech_payload_uses_device_format() {
        let payload = STANDARD.encode(pcm(&[100; 2_400]));
        let clip = decode_speech_payload(&payload, DeviceConfig::narration()).unwrap();
        assert_eq!(clip.sample_rate(), 24_000);
        assert_eq!(clip.channels(), 1);
        assert_eq!(clip.duration().as_millis(), 100);
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(matches!(decode_base64("not base64!!"), Err(DecodeError::Base64(_))));
        assert!(matches!(decode_base64(""), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_pcm16le(&[1, 2, 3], 24_000, 1),
            Err(DecodeError::OddLength { len: 3 })
        ));
    }

    #[test]
    fn test_stereo_frames_floor() {
        // 3 samples en stéréo → 1 frame complète
        let clip = decode_pcm16le(&pcm(&[1, 2, 3]), 24_000, 2).unwrap();
        assert_eq!(clip.frames(), 1);
    }
}
