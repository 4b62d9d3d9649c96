//! Shared output device
//!
//! One `DeviceManager` per engine. The hardware is opened on the first
//! `acquire` and kept for the life of the process; later calls hand back the
//! same `AudioDevice`, waking it first if it was suspended.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::error::Result;
use crate::audio::stream::OutputStream;
use crate::audio::types::{DeviceConfig, DeviceInfo, DeviceState};
use crate::audio::OutputBackend;
use crate::mixer::{Mixer, SharedMixer};

/// Lazily opened output device
pub struct DeviceManager {
    backend: Box<dyn OutputBackend>,
    config: DeviceConfig,
    /// Applied to the mixer on open, and live once open
    volume: Mutex<f32>,
    device: OnceCell<AudioDevice>,
}

impl DeviceManager {
    pub fn new(backend: Box<dyn OutputBackend>, config: DeviceConfig) -> Self {
        Self {
            backend,
            config,
            volume: Mutex::new(1.0),
            device: OnceCell::new(),
        }
    }

    /// Returns the device, opening it on first call.
    ///
    /// An open failure is returned and nothing is cached, so the next call
    /// tries again.
    pub fn acquire(&self) -> Result<&AudioDevice> {
        let device = self.device.get_or_try_init(|| {
            let mixer = Mixer::shared(self.config.sample_rate, self.config.channels);
            mixer.lock().set_volume(*self.volume.lock());
            let stream = self.backend.open(self.config, mixer.clone())?;
            let info = stream.info().clone();
            info!(
                backend = info.backend,
                device = %info.name,
                sample_rate = self.config.sample_rate,
                channels = self.config.channels,
                "audio device ready"
            );
            Ok::<_, crate::audio::AudioError>(AudioDevice {
                config: self.config,
                mixer,
                stream: Mutex::new(stream),
                info,
            })
        })?;

        if device.state() == DeviceState::Suspended {
            if let Err(e) = device.resume() {
                warn!(error = %e, "failed to resume audio device");
            }
        }
        Ok(device)
    }

    /// The device if it has been opened already
    pub fn get(&self) -> Option<&AudioDevice> {
        self.device.get()
    }

    /// Format the device renders in (known before any hardware is touched)
    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    /// Master volume (0.0 to 1.0); does not open the device
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        let mut stored = self.volume.lock();
        *stored = volume;
        if let Some(device) = self.device.get() {
            device.mixer().lock().set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }
}

/// The opened output: a mixer plus the stream pulling from it
pub struct AudioDevice {
    config: DeviceConfig,
    mixer: SharedMixer,
    stream: Mutex<Box<dyn OutputStream>>,
    info: DeviceInfo,
}

impl AudioDevice {
    pub fn mixer(&self) -> &SharedMixer {
        &self.mixer
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> DeviceState {
        if self.stream.lock().is_running() {
            DeviceState::Running
        } else {
            DeviceState::Suspended
        }
    }

    /// Pauses output. Voices keep their position until resumed.
    pub fn suspend(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.is_running() {
            stream.suspend()?;
            info!("audio device suspended");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if !stream.is_running() {
            stream.resume()?;
            info!("audio device resumed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::audio::null_stream::NullBackend;
    use crate::audio::AudioError;

    fn manager() -> DeviceManager {
        DeviceManager::new(Box::new(NullBackend::manual()), DeviceConfig::narration())
    }

    #[test]
    fn test_acquire_is_lazy_and_idempotent() {
        let manager = manager();
        assert!(manager.get().is_none());
        assert_eq!(manager.config().sample_rate, 24_000);

        let first = manager.acquire().unwrap() as *const AudioDevice;
        let second = manager.acquire().unwrap() as *const AudioDevice;
        assert_eq!(first, second);
        assert!(manager.get().is_some());
    }

    #[test]
    fn test_acquire_resumes_suspended_device() {
        let manager = manager();
        let device = manager.acquire().unwrap();
        device.suspend().unwrap();
        assert_eq!(device.state(), DeviceState::Suspended);

        let device = manager.acquire().unwrap();
        assert_eq!(device.state(), DeviceState::Running);
    }

    #[test]
    fn test_mixer_uses_device_format() {
        let manager = manager();
        let device = manager.acquire().unwrap();
        let mixer = device.mixer().lock();
        assert_eq!(mixer.sample_rate(), 24_000);
        assert_eq!(mixer.channels(), 1);
        assert_eq!(device.info().backend, "null");
    }

    #[test]
    fn test_volume_before_and_after_open() {
        let manager = manager();
        manager.set_volume(0.25);
        assert!(manager.get().is_none());

        let device = manager.acquire().unwrap();
        assert_eq!(device.mixer().lock().volume(), 0.25);

        manager.set_volume(7.0);
        assert_eq!(manager.volume(), 1.0);
        assert_eq!(device.mixer().lock().volume(), 1.0);
    }

    /// Fails the first open, succeeds afterwards
    struct FlakyBackend {
        opens: Arc<AtomicUsize>,
    }

    impl OutputBackend for FlakyBackend {
        fn open(&self, config: DeviceConfig, mixer: SharedMixer) -> Result<Box<dyn OutputStream>> {
            if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AudioError::NoDevice);
            }
            NullBackend::manual().open(config, mixer)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_open_failure_is_not_cached() {
        let opens = Arc::new(AtomicUsize::new(0));
        let manager = DeviceManager::new(
            Box::new(FlakyBackend { opens: opens.clone() }),
            DeviceConfig::narration(),
        );
        assert!(matches!(manager.acquire(), Err(AudioError::NoDevice)));
        assert!(manager.get().is_none());
        assert!(manager.acquire().is_ok());
        assert!(manager.acquire().is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}
