//! Camera control surface: start, stop and status on top of the capture loop

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::capture_loop::{CaptureLoop, StreamingState};
use super::stats::StatsSnapshot;
use crate::camera::CaptureError;

/// Body of `GET /api/camera/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub state: StreamingState,
    pub is_streaming: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub device_index: u32,

    /// Sequence of the most recent published frame
    pub sequence: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub stats: StatsSnapshot,
}

/// Start was refused; carries the status after the attempt
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StartFailure {
    pub error: CaptureError,
    pub status: CameraStatus,
}

#[derive(Clone)]
pub struct VideoControl {
    capture: Arc<CaptureLoop>,
}

impl VideoControl {
    pub fn new(capture: Arc<CaptureLoop>) -> Self {
        Self { capture }
    }

    pub fn capture(&self) -> &Arc<CaptureLoop> {
        &self.capture
    }

    pub fn get_status(&self) -> CameraStatus {
        let health = self.capture.health();
        let camera = self.capture.camera();

        CameraStatus {
            is_streaming: health.state == StreamingState::Running,
            state: health.state,
            width: camera.width,
            height: camera.height,
            fps: camera.fps,
            device_index: camera.device_index,
            sequence: self.capture.slot().sequence(),
            last_error: health.last_error,
            stats: self.capture.stats().snapshot(),
        }
    }

    /// Blocks while the device is opened.
    pub fn request_start(&self) -> Result<CameraStatus, StartFailure> {
        info!("Camera start requested");
        match self.capture.start() {
            Ok(_) => Ok(self.get_status()),
            Err(error) => Err(StartFailure {
                error,
                status: self.get_status(),
            }),
        }
    }

    /// Blocks until the capture thread has released the device.
    pub fn request_stop(&self) -> CameraStatus {
        info!("Camera stop requested");
        self.capture.stop();
        self.get_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::capture_loop::tests::{capture_loop, ScriptedOpener};

    #[test]
    fn test_status_reports_configuration() {
        let control = VideoControl::new(capture_loop(ScriptedOpener::frames(), 15, 5));
        let status = control.get_status();

        assert_eq!(status.state, StreamingState::Stopped);
        assert!(!status.is_streaming);
        assert_eq!((status.width, status.height, status.fps), (2, 2, 15));
        assert_eq!(status.device_index, 0);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_start_then_stop() {
        let control = VideoControl::new(capture_loop(ScriptedOpener::frames(), 30, 5));

        let started = control.request_start().unwrap();
        assert!(started.is_streaming);
        assert_eq!(started.state, StreamingState::Running);

        let stopped = control.request_stop();
        assert!(!stopped.is_streaming);
        assert_eq!(stopped.state, StreamingState::Stopped);
    }

    #[test]
    fn test_start_failure_carries_status() {
        let mut opener = ScriptedOpener::frames();
        opener.fail_open = true;
        let control = VideoControl::new(capture_loop(opener, 30, 5));

        let failure = control.request_start().unwrap_err();
        assert!(matches!(failure.error, CaptureError::DeviceUnavailable { .. }));
        assert_eq!(failure.status.state, StreamingState::Failed);
        assert!(!failure.status.is_streaming);
        assert!(failure.status.last_error.unwrap().contains("no such device"));
    }

    #[test]
    fn test_status_json_shape() {
        let control = VideoControl::new(capture_loop(ScriptedOpener::frames(), 30, 5));
        let json = serde_json::to_value(control.get_status()).unwrap();

        assert_eq!(json["state"], "stopped");
        assert_eq!(json["is_streaming"], false);
        assert_eq!(json["fps"], 30);
        assert!(json.get("last_error").is_none());
        assert_eq!(json["stats"]["frames_published"], 0);
    }
}
