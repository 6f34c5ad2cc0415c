//! Camera frame sources
//!
//! A [`FrameSource`] owns an opened capture device and hands out raw frames on
//! demand. Sources are opened through a [`SourceOpener`] so the capture loop can
//! be driven by a real V4L2 device, the synthetic test pattern, or anything a
//! test wants to script.

mod test_pattern;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use test_pattern::TestPatternSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4lCamera;

use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CameraConfig, SourceKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("no frame within {0:?}")]
    CaptureTimeout(Duration),

    #[error("camera returned an empty frame")]
    EmptyFrame,

    #[error("frame read failed: {0}")]
    Read(String),

    #[error("camera lost: {0}")]
    DeviceLost(String),

    #[error("frame encoding failed: {0}")]
    Encode(String),
}

impl CaptureError {
    /// A transient error costs one frame; anything else ends the capture run.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            CaptureError::DeviceUnavailable { .. } | CaptureError::DeviceLost(_)
        )
    }
}

/// Pixel layout of a raw frame as delivered by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Already JPEG-compressed (MJPG fourcc)
    Mjpeg,

    /// Packed YUV 4:2:2
    Yuyv,

    /// Packed 8-bit RGB
    Rgb24,
}

/// One uncompressed (or device-compressed) frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub captured_at: SystemTime,
}

/// An opened camera. Dropping the source releases the device.
pub trait FrameSource: Send {
    /// Read the next frame, giving up after `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, CaptureError>;

    /// Human readable name used in logs
    fn describe(&self) -> String;
}

/// Opens frame sources for the capture loop.
pub trait SourceOpener: Send + Sync {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Opens the backend selected by [`CameraConfig::source`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceOpener;

impl SourceOpener for DeviceOpener {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        match config.source {
            SourceKind::TestPattern => Ok(Box::new(TestPatternSource::new(config))),
            SourceKind::V4l2 => open_v4l2(config),
        }
    }
}

#[cfg(feature = "v4l2")]
fn open_v4l2(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(V4lCamera::open(config)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_v4l2(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    Err(CaptureError::DeviceUnavailable {
        device: config.device_path(),
        reason: "built without the `v4l2` feature".to_string(),
    })
}

/// Outcome of probing one device index
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub device_index: u32,
    pub source: Option<String>,
    pub frames_ok: u32,
    pub frames_failed: u32,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn opened(&self) -> bool {
        self.source.is_some()
    }
}

/// Try every device index below `max_index` and test-capture `frames` frames
/// from each one that opens.
pub fn probe_devices(
    opener: &dyn SourceOpener,
    base: &CameraConfig,
    max_index: u32,
    frames: u32,
    timeout: Duration,
) -> Vec<ProbeReport> {
    (0..max_index)
        .map(|device_index| {
            let config = CameraConfig {
                device_index,
                ..base.clone()
            };

            let mut source = match opener.open(&config) {
                Ok(source) => source,
                Err(e) => {
                    return ProbeReport {
                        device_index,
                        source: None,
                        frames_ok: 0,
                        frames_failed: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            let name = source.describe();
            info!(device = %name, "Probing camera");

            let mut report = ProbeReport {
                device_index,
                source: Some(name),
                frames_ok: 0,
                frames_failed: 0,
                error: None,
            };

            for i in 0..frames {
                match source.read_frame(timeout) {
                    Ok(frame) => {
                        info!(
                            frame = i + 1,
                            width = frame.width,
                            height = frame.height,
                            bytes = frame.data.len(),
                            "Probe frame OK"
                        );
                        report.frames_ok += 1;
                    }
                    Err(e) => {
                        warn!(frame = i + 1, error = %e, "Probe frame failed");
                        report.frames_failed += 1;
                        report.error = Some(e.to_string());
                    }
                }
            }

            report
        })
        .collect()
}
