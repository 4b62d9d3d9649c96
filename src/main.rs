//! Terminal host for the narration engine
//!
//! - `demo`: the four-stage walkthrough with narration and cues
//! - `say`: synthesize and speak one line
//! - `cue`: fire a single sound effect
//! - `config`: show (or write out) the effective configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use narrator::logging::{self, LogOptions};
use narrator::script::ScriptError;
use narrator::{BackendKind, Cue, EngineConfig, NarrationEngine, NarrationEnd, PlaybackError, Script, StageKey};

/// Délai entre le clic de démarrage et le carillon
const START_CHIME_DELAY: Duration = Duration::from_millis(500);

/// Marge laissée aux effets pour finir avant de quitter
const SFX_TAIL: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Arguments
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser, Debug)]
#[command(name = "narrator")]
#[command(about = "Narration and sound effects for the logistics walkthrough")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Render audio without a sound card
    #[arg(long)]
    headless: bool,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,

    /// Debug output for the engine
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scripted walkthrough
    Demo {
        /// Start at this stage (SALES, DOCS, RISK, CS or `#stage=KEY`), skipping the intro
        #[arg(long, value_parser = parse_stage)]
        stage: Option<StageKey>,

        /// Seconds to wait for a narration before skipping it
        #[arg(long, default_value_t = 30)]
        load_timeout: u64,

        /// Milliseconds between reasoning steps
        #[arg(long, default_value_t = 1000)]
        step_ms: u64,
    },
    /// Speak one line of text
    Say { text: String },
    /// Play one sound effect (click, clack, scan, success)
    Cue { cue: Cue },
    /// Print the effective configuration
    Config {
        /// Write it to the user config file
        #[arg(long)]
        save: bool,
    },
}

/// Stage key, plain or as the web demo's deep link
fn parse_stage(value: &str) -> std::result::Result<StageKey, ScriptError> {
    match StageKey::from_fragment(value) {
        Some(key) => Ok(key),
        None => value.parse(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(LogOptions {
        file: cli.log_file,
        debug: cli.verbose,
        dir: None,
    });

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = EngineConfig::load_from(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            config.apply_env_with(|name| std::env::var(name).ok());
            config
        }
        None => EngineConfig::load(),
    };
    if cli.headless {
        config.output.backend = BackendKind::Null;
    }

    if let Command::Config { save } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        println!("credential: {}", if config.has_credential() { "set" } else { "missing" });
        if save {
            config.save().context("failed to write config")?;
            println!("saved to {}", narrator::config::config_path().display());
        }
        return Ok(());
    }

    let engine = NarrationEngine::new(&config)?;
    let device = engine.acquire_device().context("no audio output available")?;
    info!(
        backend = device.backend,
        device = %device.name,
        hardware_rate = device.hardware_sample_rate,
        resampled = device.resampled,
        "output ready"
    );

    match cli.command {
        Command::Demo {
            stage,
            load_timeout,
            step_ms,
        } => {
            let script = match &config.script_path {
                Some(path) => Script::load(path)
                    .with_context(|| format!("failed to load script {}", path.display()))?,
                None => Script::bundled().context("bundled script is invalid")?,
            };
            let demo = Demo {
                engine: &engine,
                script: &script,
                load_timeout: Duration::from_secs(load_timeout),
                step: Duration::from_millis(step_ms),
            };
            demo.run(stage).await;
        }
        Command::Say { text } => say(&engine, &text).await?,
        Command::Cue { cue } => {
            engine.play_cue(cue)?;
            tokio::time::sleep(cue.duration() + SFX_TAIL).await;
        }
        Command::Config { .. } => {}
    }

    let stats = engine.cache_stats();
    debug!(
        cached = stats.cached,
        requests = stats.requests,
        failures = stats.failures,
        "session done"
    );
    Ok(())
}

async fn say(engine: &NarrationEngine, text: &str) -> Result<()> {
    if !engine.has_provider() {
        anyhow::bail!("no speech credential set (NARRATOR_API_KEY, GEMINI_API_KEY or API_KEY)");
    }
    let narration = match engine.play_narration(text).await {
        Ok(narration) => narration,
        Err(PlaybackError::Unavailable { attempts }) => {
            anyhow::bail!("speech synthesis failed after {attempts} attempt(s), see logs")
        }
        Err(e) => return Err(e.into()),
    };
    println!("Speaking ({:.1}s)...", narration.duration().as_secs_f32());
    if narration.finished().await == NarrationEnd::Interrupted {
        println!("Interrupted.");
    }
    Ok(())
}

/// Fires a cue; a failing cue never stops the show
fn sfx(engine: &NarrationEngine, cue: Cue) {
    if let Err(e) = engine.play_cue(cue) {
        warn!(cue = %cue, error = %e, "sound effect failed");
    }
}

struct Demo<'a> {
    engine: &'a NarrationEngine,
    script: &'a Script,
    load_timeout: Duration,
    step: Duration,
}

impl Demo<'_> {
    async fn run(&self, start: Option<StageKey>) {
        // Préchargement de toutes les narrations au démarrage
        let started = self.engine.preload_all(self.script.narrations());
        if !self.engine.has_provider() {
            println!("(no speech credential: narration is disabled, sound effects only)");
        } else {
            info!(started, "narrations loading in the background");
        }

        let first = match start.and_then(|key| self.script.position(key)) {
            Some(index) => index,
            None => {
                self.intro().await;
                0
            }
        };

        for stage in &self.script.stages[first..] {
            self.stage(stage).await;
        }

        self.summary().await;
    }

    async fn intro(&self) {
        println!("=== INTRO ===");
        self.report_ready(&self.script.intro);
        self.narrate(&self.script.intro).await;

        sfx(self.engine, Cue::Click);
        tokio::time::sleep(START_CHIME_DELAY).await;
        sfx(self.engine, Cue::Success);
    }

    async fn stage(&self, stage: &narrator::Stage) {
        println!();
        println!("=== {} · {} ===", stage.key, stage.title);
        if !stage.tech_stack.is_empty() {
            println!("    {}", stage.tech_stack.join(" / "));
        }
        println!("{}", stage.initial_log);
        self.report_ready(&stage.narration);
        self.narrate(&stage.narration).await;

        println!("> {}", stage.action_text);
        sfx(self.engine, Cue::Click);
        sfx(self.engine, Cue::Scan);
        for step in &stage.reasoning_steps {
            sfx(self.engine, Cue::Clack);
            println!("[{}] {}", step.tech, step.status);
            tokio::time::sleep(self.step).await;
        }
        sfx(self.engine, Cue::Clack);
        println!("[决策完成] 指令已正式同步：{}", stage.completed_text);
        sfx(self.engine, Cue::Success);
        tokio::time::sleep(Cue::Success.duration()).await;

        if !stage.next_action_text.is_empty() {
            println!("> {}", stage.next_action_text);
        }
        sfx(self.engine, Cue::Click);
        self.engine.stop_all();
    }

    async fn summary(&self) {
        println!();
        println!("=== SUMMARY ===");
        sfx(self.engine, Cue::Success);
        self.report_ready(&self.script.summary);
        self.narrate(&self.script.summary).await;
        tokio::time::sleep(SFX_TAIL).await;
    }

    fn report_ready(&self, text: &str) {
        if self.engine.is_cached(text) {
            println!("  [narration ready]");
        } else if self.engine.has_provider() {
            println!("  [narration loading...]");
        }
    }

    /// Plays a narration to its end, waiting a bounded time for it to load
    async fn narrate(&self, text: &str) {
        if !self.engine.has_provider() {
            return;
        }
        if !self.engine.is_cached(text) {
            match tokio::time::timeout(self.load_timeout, self.engine.wait_cached(text)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(text_len = text.len(), "narration unavailable, skipping");
                    return;
                }
                Err(_) => {
                    warn!(
                        text_len = text.len(),
                        timeout_secs = self.load_timeout.as_secs(),
                        "narration still loading, skipping"
                    );
                    return;
                }
            }
        }

        match self.engine.play_narration(text).await {
            Ok(narration) => {
                let end = narration.finished().await;
                debug!(?end, "narration finished");
            }
            Err(e) => warn!(error = %e, "narration skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_accepts_deep_link() {
        assert_eq!(parse_stage("risk").unwrap(), StageKey::Risk);
        assert_eq!(parse_stage("#stage=CS").unwrap(), StageKey::Cs);
        assert_eq!(parse_stage("stage=DOCS").unwrap(), StageKey::Docs);
        assert!(parse_stage("#stage=LATER").is_err());
    }

    #[test]
    fn test_cli_parses_demo_stage() {
        let cli = Cli::try_parse_from(["narrator", "--headless", "demo", "--stage", "#stage=SALES"]).unwrap();
        assert!(cli.headless);
        assert!(matches!(
            cli.command,
            Command::Demo {
                stage: Some(StageKey::Sales),
                ..
            }
        ));
    }
}
