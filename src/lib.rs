//! Multi-client MJPEG streaming for a single USB camera
//!
//! A background capture loop owns the camera and publishes JPEG frames into a
//! shared latest-frame slot. Any number of HTTP clients read from that slot
//! through `/video_feed`, each at its own pace, while `/api/camera/*` starts,
//! stops and reports on the capture loop.
//!
//! # Example
//!
//! ```no_run
//! use cctv_streamer::{camera::DeviceOpener, CaptureLoop, CaptureStats, Config, FrameSlot};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let capture = CaptureLoop::new(
//!     config.camera.clone(),
//!     config.capture.clone(),
//!     Arc::new(DeviceOpener),
//!     Arc::new(FrameSlot::new()),
//!     Arc::new(CaptureStats::new()),
//! );
//! capture.start()?;
//! # Ok::<(), cctv_streamer::camera::CaptureError>(())
//! ```

pub mod camera;
pub mod config;
pub mod processing;
pub mod streaming;
pub mod web_server;

// Re-exports for convenience
pub use config::Config;
pub use streaming::{
    CameraStatus, CaptureLoop, CaptureStats, FrameSlot, StreamingState, VideoControl,
};
pub use web_server::{router, run_server, AppState};
