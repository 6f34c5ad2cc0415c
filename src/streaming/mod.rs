//! Live streaming engine: capture loop, shared frame slot, client responders
//! and the control surface on top of them

pub mod capture_loop;
pub mod frame_slot;
pub mod responder;
mod stats;
pub mod video_control;

pub use capture_loop::{CaptureLoop, LoopHealth, StreamingState};
pub use frame_slot::{FrameSlot, SharedFrame, WaitOutcome};
pub use responder::{ClientSession, SessionEnd, StreamUnavailable};
pub use stats::{CaptureStats, StatsSnapshot};
pub use video_control::{CameraStatus, StartFailure, VideoControl};
