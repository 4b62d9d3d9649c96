//! Output backend without hardware
//!
//! `manual` mode opens nothing: whoever holds the mixer renders it by hand,
//! which is how tests move audio time forward. `realtime` mode runs a clock
//! thread that renders and discards blocks at wall-clock pace, so headless
//! hosts still see narrations end on time.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::audio::error::{AudioError, Result};
use crate::audio::stream::{OutputStream, StreamCommand};
use crate::audio::types::{DeviceConfig, DeviceInfo};
use crate::audio::OutputBackend;
use crate::mixer::SharedMixer;

/// Block length of the realtime clock
const CLOCK_BLOCK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Manual,
    Realtime,
}

/// Backend that renders into the void
pub struct NullBackend {
    mode: ClockMode,
}

impl NullBackend {
    /// No clock thread; the caller renders the mixer
    pub fn manual() -> Self {
        Self { mode: ClockMode::Manual }
    }

    /// Clock thread rendering at wall-clock pace
    pub fn realtime() -> Self {
        Self { mode: ClockMode::Realtime }
    }
}

impl OutputBackend for NullBackend {
    fn open(&self, config: DeviceConfig, mixer: SharedMixer) -> Result<Box<dyn OutputStream>> {
        let info = DeviceInfo {
            backend: self.name(),
            name: match self.mode {
                ClockMode::Manual => "null (manual clock)".to_string(),
                ClockMode::Realtime => "null (realtime clock)".to_string(),
            },
            hardware_sample_rate: config.sample_rate,
            hardware_channels: config.channels,
            resampled: false,
        };

        let command_tx = match self.mode {
            ClockMode::Manual => None,
            ClockMode::Realtime => {
                let (tx, rx) = bounded::<StreamCommand>(8);
                thread::Builder::new()
                    .name("narrator-null-clock".to_string())
                    .spawn(move || clock_thread_main(rx, mixer, config))
                    .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;
                Some(tx)
            }
        };

        Ok(Box::new(NullStream {
            info,
            running: true,
            command_tx,
        }))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Stream handle for the null backend
pub struct NullStream {
    info: DeviceInfo,
    running: bool,
    command_tx: Option<Sender<StreamCommand>>,
}

impl NullStream {
    fn send(&self, command: StreamCommand) -> Result<()> {
        match &self.command_tx {
            Some(tx) => tx.send(command).map_err(|_| AudioError::ThreadGone),
            None => Ok(()),
        }
    }
}

impl OutputStream for NullStream {
    fn suspend(&mut self) -> Result<()> {
        self.send(StreamCommand::Suspend)?;
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.send(StreamCommand::Resume)?;
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

impl Drop for NullStream {
    fn drop(&mut self) {
        let _ = self.send(StreamCommand::Shutdown);
    }
}

fn clock_thread_main(commands: Receiver<StreamCommand>, mixer: SharedMixer, config: DeviceConfig) {
    let frames = config.frames_for(CLOCK_BLOCK.as_secs_f32());
    let mut scratch = vec![0.0f32; frames * config.channels as usize];
    let mut running = true;
    let mut next_tick = Instant::now();

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match commands.recv_timeout(timeout) {
            Ok(StreamCommand::Suspend) => running = false,
            Ok(StreamCommand::Resume) => {
                running = true;
                next_tick = Instant::now();
            }
            Ok(StreamCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if running {
                    let mut mixer = mixer.lock();
                    // Rien en file : un stop n'a rien à vider
                    mixer.take_flush_request();
                    // Le bloc rendu s'écoule pendant le tick suivant
                    mixer.set_output_latency(frames as u64);
                    mixer.render(&mut scratch);
                }
                next_tick += CLOCK_BLOCK;
            }
        }
    }
    debug!("null clock stopped");
}
