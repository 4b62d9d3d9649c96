// === STAGE SCRIPT ===
// Table figée des quatre étapes de la démo + narrations d'intro et de synthèse
// Embarquée dans le binaire (assets/script.json), remplaçable par un fichier

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nombre d'étapes attendu
pub const STAGE_COUNT: usize = 4;

const BUNDLED_SCRIPT: &str = include_str!("../assets/script.json");

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("script is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("script must have exactly {STAGE_COUNT} stages, found {0}")]
    StageCount(usize),

    #[error("stage {0} appears more than once")]
    DuplicateStage(StageKey),

    #[error("narration for {0} is empty")]
    EmptyNarration(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageKey {
    Sales,
    Docs,
    Risk,
    Cs,
}

impl StageKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKey::Sales => "SALES",
            StageKey::Docs => "DOCS",
            StageKey::Risk => "RISK",
            StageKey::Cs => "CS",
        }
    }

    /// Parses a `stage=KEY` deep link (leading `#` allowed)
    pub fn from_fragment(fragment: &str) -> Option<Self> {
        fragment
            .trim_start_matches('#')
            .strip_prefix("stage=")
            .and_then(|key| key.parse().ok())
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKey {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SALES" => Ok(StageKey::Sales),
            "DOCS" => Ok(StageKey::Docs),
            "RISK" => Ok(StageKey::Risk),
            "CS" => Ok(StageKey::Cs),
            _ => Err(ScriptError::UnknownStage(s.to_string())),
        }
    }
}

/// One simulated reasoning step shown while a stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub status: String,
    pub tech: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub key: StageKey,
    pub title: String,
    /// Label of the action that runs the stage
    pub action_text: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    /// Log line the stage opens with
    #[serde(default)]
    pub initial_log: String,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub narration: String,
    pub completed_text: String,
    #[serde(default)]
    pub next_action_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub intro: String,
    pub stages: Vec<Stage>,
    pub summary: String,
}

impl Script {
    /// The demo content shipped with the binary
    pub fn bundled() -> Result<Self, ScriptError> {
        Self::parse(BUNDLED_SCRIPT)
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self, ScriptError> {
        let script: Self = serde_json::from_str(json)?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<(), ScriptError> {
        if self.stages.len() != STAGE_COUNT {
            return Err(ScriptError::StageCount(self.stages.len()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if self.stages[..i].iter().any(|other| other.key == stage.key) {
                return Err(ScriptError::DuplicateStage(stage.key));
            }
            if stage.narration.trim().is_empty() {
                return Err(ScriptError::EmptyNarration(stage.key.to_string()));
            }
        }
        if self.intro.trim().is_empty() {
            return Err(ScriptError::EmptyNarration("intro".to_string()));
        }
        if self.summary.trim().is_empty() {
            return Err(ScriptError::EmptyNarration("summary".to_string()));
        }
        Ok(())
    }

    /// Every narration in playback order: intro, the stages, summary
    pub fn narrations(&self) -> Vec<&str> {
        std::iter::once(self.intro.as_str())
            .chain(self.stages.iter().map(|stage| stage.narration.as_str()))
            .chain(std::iter::once(self.summary.as_str()))
            .collect()
    }

    pub fn stage(&self, key: StageKey) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.key == key)
    }

    pub fn position(&self, key: StageKey) -> Option<usize> {
        self.stages.iter().position(|stage| stage.key == key)
    }
}
