// Simulated triggered camera for test runs without hardware
//
// A background thread plays the role of the PWM trigger box: bursts of
// `chunk_size` pulses at `frequency_hz`, separated by `chunk_pause`. Pulses
// only reach the frame callback while the pipeline is started, like a camera
// whose pipeline is torn down between chunks.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::pipeline::{FrameCallback, PipelineAdapter, PipelineError};
use crate::session::DeviceProperty;

/// Shape of the simulated trigger signal
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPattern {
    pub frequency_hz: f64,
    /// Pulses per burst (0 = one endless burst)
    pub chunk_size: u64,
    pub chunk_pause: Duration,
    /// Stop triggering after this many bursts
    pub max_bursts: Option<u64>,
}

impl TriggerPattern {
    pub fn new(frequency_hz: f64, chunk_size: u64, chunk_pause: Duration) -> Self {
        Self {
            frequency_hz,
            chunk_size,
            chunk_pause,
            max_bursts: None,
        }
    }

    pub fn with_max_bursts(mut self, bursts: u64) -> Self {
        self.max_bursts = Some(bursts);
        self
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency_hz.max(f64::MIN_POSITIVE))
    }
}

pub struct SimulatedCamera {
    pattern: TriggerPattern,
    callback: Option<FrameCallback>,
    delivering: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    pulses: Arc<AtomicU64>,
    trigger_handle: Option<std::thread::JoinHandle<()>>,
    target: Option<PathBuf>,
}

impl SimulatedCamera {
    pub fn new(pattern: TriggerPattern) -> Self {
        Self {
            pattern,
            callback: None,
            delivering: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            pulses: Arc::new(AtomicU64::new(0)),
            trigger_handle: None,
            target: None,
        }
    }

    /// Trigger pulses emitted so far, delivered or not
    pub fn pulses(&self) -> u64 {
        self.pulses.load(Ordering::Relaxed)
    }

    pub fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Start the trigger thread on first use; it runs until drop
    fn ensure_trigger(&mut self) -> Result<(), PipelineError> {
        if self.trigger_handle.is_some() {
            return Ok(());
        }

        let pattern = self.pattern.clone();
        let callback = self.callback.clone();
        let delivering = self.delivering.clone();
        let stop_flag = self.stop_flag.clone();
        let pulses = self.pulses.clone();

        let handle = std::thread::Builder::new()
            .name("chunkcam-trigger".into())
            .spawn(move || {
                let period = pattern.period();
                let mut bursts = 0u64;
                while !stop_flag.load(Ordering::SeqCst) {
                    if pattern.max_bursts.is_some_and(|max| bursts >= max) {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }

                    let mut sent = 0u64;
                    while pattern.chunk_size == 0 || sent < pattern.chunk_size {
                        if stop_flag.load(Ordering::SeqCst) {
                            return;
                        }
                        std::thread::sleep(period);
                        pulses.fetch_add(1, Ordering::Relaxed);
                        if delivering.load(Ordering::SeqCst) {
                            if let Some(callback) = &callback {
                                callback();
                            }
                        }
                        sent += 1;
                    }
                    bursts += 1;

                    // Pause in short steps so drop stays responsive
                    let mut paused = Duration::ZERO;
                    while paused < pattern.chunk_pause && !stop_flag.load(Ordering::SeqCst) {
                        let step = (pattern.chunk_pause - paused).min(Duration::from_millis(10));
                        std::thread::sleep(step);
                        paused += step;
                    }
                }
            })
            .map_err(|e| PipelineError::Start(format!("failed to spawn trigger thread: {}", e)))?;

        log::info!(
            "Simulated trigger started ({:.1}Hz, {} pulses per burst, {}ms pause)",
            self.pattern.frequency_hz,
            self.pattern.chunk_size,
            self.pattern.chunk_pause.as_millis()
        );
        self.trigger_handle = Some(handle);
        Ok(())
    }
}

impl PipelineAdapter for SimulatedCamera {
    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self, target: &Path, properties: &[DeviceProperty]) -> Result<(), PipelineError> {
        for property in properties {
            log::debug!("Setting property {} at {}", property.name, property.value);
        }

        File::create(target).map_err(|e| {
            PipelineError::Start(format!("cannot create {}: {}", target.display(), e))
        })?;
        self.target = Some(target.to_path_buf());

        self.ensure_trigger()?;
        self.delivering.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        self.delivering.store(false, Ordering::SeqCst);
        self.target = None;
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.delivering.store(false, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.trigger_handle.take() {
            let _ = handle.join();
        }
    }
}
