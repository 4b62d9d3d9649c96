// === CONFIGURATION ===
// config.json dans le dossier de config utilisateur, valeurs par défaut sinon
// La clé API ne vient QUE de l'environnement et n'est jamais écrite sur disque

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audio::BackendKind;

/// Variables d'environnement lues pour la clé, dans l'ordre
pub const API_KEY_VARS: [&str; 3] = ["NARRATOR_API_KEY", "GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub speech: SpeechSettings,
    pub output: OutputSettings,
    pub playback: PlaybackSettings,
    /// Replaces the bundled stage script when set
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    pub model: String,
    pub voice: String,
    /// Delivery instruction; `{text}` is replaced by the narration
    pub prompt_template: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-preview-tts".to_string(),
            voice: "Zephyr".to_string(),
            prompt_template: "Say calmly and professionally: {text}".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 30,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub backend: BackendKind,
    /// Master volume (0.0 to 1.0)
    pub volume: f32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpal,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// New provider fetches one play request may start (minimum 1)
    pub max_fetch_attempts: u32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self { max_fetch_attempts: 2 }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("narrator")
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("narrator")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl EngineConfig {
    /// Loads the user config. Missing or corrupt file → defaults.
    /// The API key is taken from the environment.
    pub fn load() -> Self {
        let path = config_path();
        let mut config = if path.exists() {
            Self::load_from(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Self::default()
            })
        } else {
            Self::default()
        };
        config.apply_env_with(|name| std::env::var(name).ok());
        config
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config.normalized())
    }

    /// Fills the API key from the first non-empty variable of `API_KEY_VARS`
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = API_KEY_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
        {
            self.speech.api_key = Some(key);
        }
    }

    pub fn has_credential(&self) -> bool {
        self.speech
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path())
    }

    /// Writes the config (owner-only permissions on Unix)
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.output.volume = if self.output.volume.is_finite() {
            self.output.volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.playback.max_fetch_attempts = self.playback.max_fetch_attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.speech.model, "gemini-2.5-flash-preview-tts");
        assert_eq!(config.speech.voice, "Zephyr");
        assert_eq!(config.output.backend, BackendKind::Cpal);
        assert_eq!(config.playback.max_fetch_attempts, 2);
        assert!(!config.has_credential());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "output": { "backend": "null", "volume": 4.0 }, "playback": { "max_fetch_attempts": 0 } }"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.output.backend, BackendKind::Null);
        assert_eq!(config.output.volume, 1.0);
        assert_eq!(config.playback.max_fetch_attempts, 1);
        assert_eq!(config.speech.voice, "Zephyr");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_api_key_precedence() {
        let env: HashMap<&str, &str> = [("GEMINI_API_KEY", "gemini"), ("API_KEY", "generic"), ("NARRATOR_API_KEY", " ")]
            .into_iter()
            .collect();
        let mut config = EngineConfig::default();
        config.apply_env_with(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.speech.api_key.as_deref(), Some("gemini"));
        assert!(config.has_credential());
    }

    #[test]
    fn test_save_never_writes_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = EngineConfig::default();
        config.speech.api_key = Some("secret".to_string());
        config.output.volume = 0.5;
        config.save_to(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret"));
        let reloaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.output.volume, 0.5);
        assert_eq!(reloaded.speech.api_key, None);
    }
}
