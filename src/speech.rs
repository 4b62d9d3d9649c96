// === SPEECH SYNTHESIS ===
// Contrat du fournisseur TTS : un prompt en entrée, du PCM base64 en sortie
// Implémentation REST Gemini (generateContent avec modalité AUDIO)

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::audio_decoder::DecodeError;
use crate::config::SpeechSettings;

/// Client HTTP partagé (connexions réutilisées entre les requêtes)
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("narrator/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new())
});

/// Longueur max du corps d'erreur conservé dans les logs
const ERROR_BODY_LIMIT: usize = 512;

/// Output modality requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

/// One synthesis call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub prompt: String,
    pub modality: Modality,
    pub voice: String,
}

impl SpeechRequest {
    /// Wraps narration text in the delivery instruction.
    ///
    /// `{text}` in the template is replaced by the trimmed text; a template
    /// without the placeholder gets the text appended.
    pub fn narration(text: &str, template: &str, voice: &str) -> Self {
        let text = text.trim();
        let prompt = if template.contains("{text}") {
            template.replace("{text}", text)
        } else {
            format!("{} {}", template.trim_end(), text)
        };
        Self {
            prompt,
            modality: Modality::Audio,
            voice: voice.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech provider answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("speech response carried no audio")]
    NoAudio,

    #[error("speech audio could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

/// External speech-synthesis provider
///
/// Returns the audio as base64 of raw signed 16-bit little-endian mono PCM
/// at the narration sample rate.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, request: &SpeechRequest) -> Result<String, SynthesisError>;
}

/// Gemini `generateContent` TTS client
pub struct GeminiSpeechProvider {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl GeminiSpeechProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    /// None when no credential is configured
    pub fn from_config(settings: &SpeechSettings) -> Option<Self> {
        let key = settings.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())?;
        Some(Self::new(
            key,
            settings.base_url.clone(),
            settings.model.clone(),
            Duration::from_secs(settings.request_timeout_secs.max(1)),
        ))
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiSpeechProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<String, SynthesisError> {
        let body = wire::GenerateRequest::from_request(request);
        debug!(model = %self.model, voice = %request.voice, "sending speech request");

        let response = HTTP_CLIENT
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: wire::GenerateResponse = response.json().await?;
        extract_audio(&parsed)
            .map(str::to_owned)
            .ok_or(SynthesisError::NoAudio)
    }
}

/// First non-empty inline audio payload of the first candidate
fn extract_audio(response: &wire::GenerateResponse) -> Option<&str> {
    response
        .candidates
        .first()?
        .content
        .as_ref()?
        .parts
        .iter()
        .filter_map(|part| part.inline_data.as_ref())
        .map(|inline| inline.data.as_str())
        .find(|data| !data.is_empty())
}

/// JSON bodies of the generateContent endpoint
mod wire {
    use serde::{Deserialize, Serialize};

    use super::{Modality, SpeechRequest};

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GenerateRequest<'a> {
        pub contents: Vec<Content<'a>>,
        pub generation_config: GenerationConfig<'a>,
    }

    impl<'a> GenerateRequest<'a> {
        pub fn from_request(request: &'a SpeechRequest) -> Self {
            Self {
                contents: vec![Content {
                    parts: vec![TextPart {
                        text: &request.prompt,
                    }],
                }],
                generation_config: GenerationConfig {
                    response_modalities: vec![request.modality],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: &request.voice,
                            },
                        },
                    },
                },
            }
        }
    }

    #[derive(Debug, Serialize)]
    pub struct Content<'a> {
        pub parts: Vec<TextPart<'a>>,
    }

    #[derive(Debug, Serialize)]
    pub struct TextPart<'a> {
        pub text: &'a str,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GenerationConfig<'a> {
        pub response_modalities: Vec<Modality>,
        pub speech_config: SpeechConfig<'a>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SpeechConfig<'a> {
        pub voice_config: VoiceConfig<'a>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct VoiceConfig<'a> {
        pub prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PrebuiltVoiceConfig<'a> {
        pub voice_name: &'a str,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct GenerateResponse {
        pub candidates: Vec<Candidate>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Candidate {
        pub content: Option<CandidateContent>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct CandidateContent {
        pub parts: Vec<ResponsePart>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct ResponsePart {
        pub inline_data: Option<InlineData>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct InlineData {
        pub data: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_narration_prompt() {
        let request = SpeechRequest::narration(
            "  Welcome aboard. ",
            "Say calmly and professionally: {text}",
            "Zephyr",
        );
        assert_eq!(request.prompt, "Say calmly and professionally: Welcome aboard.");
        assert_eq!(request.modality, Modality::Audio);
        assert_eq!(request.voice, "Zephyr");

        let bare = SpeechRequest::narration("Hi", "Read this:", "Puck");
        assert_eq!(bare.prompt, "Read this: Hi");
    }

    #[test]
    fn test_request_body_shape() {
        let request = SpeechRequest::narration("Hello", "Say: {text}", "Zephyr");
        let body = serde_json::to_value(wire::GenerateRequest::from_request(&request)).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [{ "parts": [{ "text": "Say: Hello" }] }],
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": "Zephyr" }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_extract_audio() {
        let response: wire::GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "ignored" },
                        { "inlineData": { "mimeType": "audio/L16;codec=pcm;rate=24000", "data": "AAAA" } }
                    ]
                }
            }]
        }))
        .unwrap();
        assert_eq!(extract_audio(&response), Some("AAAA"));

        let empty: wire::GenerateResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert_eq!(extract_audio(&empty), None);

        let blocked: wire::GenerateResponse =
            serde_json::from_value(json!({ "candidates": [{ "finishReason": "SAFETY" }] })).unwrap();
        assert_eq!(extract_audio(&blocked), None);
    }

    #[test]
    fn test_from_config_requires_key() {
        let mut settings = SpeechSettings::default();
        settings.api_key = None;
        assert!(GeminiSpeechProvider::from_config(&settings).is_none());

        settings.api_key = Some("   ".to_string());
        assert!(GeminiSpeechProvider::from_config(&settings).is_none());

        settings.api_key = Some("secret".to_string());
        settings.base_url = "https://example.test/v1beta/".to_string();
        let provider = GeminiSpeechProvider::from_config(&settings).unwrap();
        assert_eq!(provider.name(), "gemini");
        assert_eq!(
            provider.endpoint(),
            format!("https://example.test/v1beta/models/{}:generateContent", settings.model)
        );
    }
}
