//! Background capture loop
//!
//! The loop is the single owner of the camera. `start()` opens the source on
//! the caller's thread (so the caller learns about open failures directly),
//! then hands it to a dedicated capture thread that reads, encodes and
//! publishes frames at the configured rate. Transitions are serialized by the
//! `worker` mutex, so two concurrent `start()` calls can never open the
//! device twice.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::frame_slot::FrameSlot;
use super::stats::{CaptureStats, StatsSnapshot};
use crate::camera::{CaptureError, FrameSource, SourceOpener};
use crate::config::{CameraConfig, CaptureConfig};
use crate::processing::FrameEncoder;

/// Frames between two stats log lines
const STATS_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Current state plus the reason for the last failure, if any
#[derive(Debug, Clone)]
pub struct LoopHealth {
    pub state: StreamingState,
    pub last_error: Option<String>,
}

struct Worker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn join(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            error!("Capture thread panicked");
        }
    }
}

pub struct CaptureLoop {
    camera: CameraConfig,
    tuning: CaptureConfig,
    opener: Arc<dyn SourceOpener>,
    slot: Arc<FrameSlot>,
    stats: Arc<CaptureStats>,
    health: Arc<RwLock<LoopHealth>>,
    worker: Mutex<Option<Worker>>,
}

impl CaptureLoop {
    pub fn new(
        camera: CameraConfig,
        tuning: CaptureConfig,
        opener: Arc<dyn SourceOpener>,
        slot: Arc<FrameSlot>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            camera,
            tuning,
            opener,
            slot,
            stats,
            health: Arc::new(RwLock::new(LoopHealth {
                state: StreamingState::Stopped,
                last_error: None,
            })),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamingState {
        self.health.read().state
    }

    pub fn health(&self) -> LoopHealth {
        self.health.read().clone()
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    fn set_health(&self, state: StreamingState, last_error: Option<String>) {
        let mut health = self.health.write();
        health.state = state;
        health.last_error = last_error;
    }

    /// Open the camera and begin capturing. No-op while already running.
    pub fn start(&self) -> Result<StreamingState, CaptureError> {
        let mut worker = self.worker.lock();

        if self.state() == StreamingState::Running {
            debug!("Capture already running");
            return Ok(StreamingState::Running);
        }

        // A run that failed on its own may still be releasing the device
        if let Some(finished) = worker.take() {
            finished.join();
        }

        self.set_health(StreamingState::Starting, None);
        self.slot.clear();

        info!(
            device_index = self.camera.device_index,
            resolution = %format!("{}x{}", self.camera.width, self.camera.height),
            fps = self.camera.fps,
            "Starting capture"
        );

        let source = match self.opener.open(&self.camera) {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "Failed to open camera");
                self.set_health(StreamingState::Failed, Some(e.to_string()));
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = mpsc::channel();
        let task = CaptureTask {
            source,
            encoder: FrameEncoder::new(self.camera.quality),
            slot: Arc::clone(&self.slot),
            stats: Arc::clone(&self.stats),
            health: Arc::clone(&self.health),
            period: self.camera.frame_period(),
            read_timeout: self.tuning.read_timeout(),
            max_failures: self.tuning.max_consecutive_failures,
            stop_rx,
        };

        // Running must be visible before the thread can report a failure
        self.set_health(StreamingState::Running, None);
        self.slot.set_active(true);

        match thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || task.run())
        {
            Ok(handle) => {
                *worker = Some(Worker { stop_tx, handle });
                info!("Capture started");
                Ok(StreamingState::Running)
            }
            Err(e) => {
                self.slot.set_active(false);
                let err = CaptureError::DeviceUnavailable {
                    device: self.camera.device_path(),
                    reason: format!("failed to spawn capture thread: {}", e),
                };
                self.set_health(StreamingState::Failed, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop capturing and release the camera. Always ends in `Stopped`.
    pub fn stop(&self) -> StreamingState {
        let mut worker = self.worker.lock();

        let Some(running) = worker.take() else {
            if self.state() != StreamingState::Stopped {
                info!(state = ?self.state(), "Clearing capture state");
            }
            self.set_health(StreamingState::Stopped, None);
            return StreamingState::Stopped;
        };

        info!("Stopping capture");
        self.set_health(StreamingState::Stopping, None);
        self.slot.set_active(false);

        running.join();

        self.set_health(StreamingState::Stopped, None);
        info!("Capture stopped");
        StreamingState::Stopped
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        if let Some(running) = self.worker.get_mut().take() {
            self.slot.set_active(false);
            running.join();
        }
    }
}

/// State moved onto the capture thread
struct CaptureTask {
    source: Box<dyn FrameSource>,
    encoder: FrameEncoder,
    slot: Arc<FrameSlot>,
    stats: Arc<CaptureStats>,
    health: Arc<RwLock<LoopHealth>>,
    period: Duration,
    read_timeout: Duration,
    max_failures: u32,
    stop_rx: mpsc::Receiver<()>,
}

impl CaptureTask {
    fn run(mut self) {
        let name = self.source.describe();
        info!(source = %name, "Capture loop started");

        let failure = self.pump();

        // Publish the failure before releasing the device: a concurrent
        // start() must see Failed, and it joins this thread before reopening.
        if let Some(reason) = failure {
            error!(source = %name, reason = %reason, "Capture failed");
            self.slot.set_active(false);
            let mut health = self.health.write();
            health.state = StreamingState::Failed;
            health.last_error = Some(reason);
        }

        drop(self.source);
        info!(source = %name, "Capture source closed");
    }

    /// Capture until stopped (`None`) or the device is given up on (`Some(reason)`).
    fn pump(&mut self) -> Option<String> {
        let mut consecutive_failures = 0u32;
        let mut last_report = (Instant::now(), self.stats.snapshot());

        loop {
            let started = Instant::now();

            match self.capture_once() {
                Ok(sequence) => {
                    if consecutive_failures > 0 {
                        info!(after = consecutive_failures, "Capture recovered");
                    }
                    consecutive_failures = 0;

                    if sequence % STATS_INTERVAL == 0 {
                        self.report(&mut last_report);
                    }
                }
                Err(e) if !e.is_transient() => return Some(e.to_string()),
                Err(e) => {
                    consecutive_failures += 1;
                    self.stats.record_failure();
                    warn!(
                        error = %e,
                        consecutive = consecutive_failures,
                        "Frame capture failed, keeping last frame"
                    );

                    if consecutive_failures >= self.max_failures {
                        return Some(format!(
                            "{} consecutive capture failures (last: {})",
                            consecutive_failures, e
                        ));
                    }
                }
            }

            // Sleep off the rest of the period; a slow iteration is never made up
            let wait = self.period.saturating_sub(started.elapsed());
            match self.stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Capture stop requested");
                    return None;
                }
            }
        }
    }

    fn capture_once(&mut self) -> Result<u64, CaptureError> {
        let raw = self.source.read_frame(self.read_timeout)?;
        let captured_at = raw.captured_at;
        let jpeg = self.encoder.encode(raw)?;
        let bytes = jpeg.len();

        let sequence = self.slot.publish(jpeg, captured_at);
        self.stats.record_publish(bytes);
        Ok(sequence)
    }

    fn report(&self, last: &mut (Instant, StatsSnapshot)) {
        let now = Instant::now();
        let snapshot = self.stats.snapshot();
        let elapsed = now.duration_since(last.0).as_secs_f64();

        info!(
            fps = %format!("{:.1}", snapshot.calculate_fps(&last.1, elapsed)),
            kbps = %format!("{:.0}", snapshot.calculate_bitrate_kbps(&last.1, elapsed)),
            published = snapshot.frames_published,
            failures = snapshot.read_failures,
            clients = snapshot.active_clients,
            "Capture stats"
        );

        *last = (now, snapshot);
    }
}
