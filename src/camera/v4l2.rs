//! USB camera access through V4L2

use std::io;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use v4l::{
    buffer::Type,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::{capture::Parameters, Capture},
    Device, Format, FourCC,
};

use super::{CaptureError, FrameSource, PixelFormat, RawFrame};
use crate::config::CameraConfig;

const BUFFER_COUNT: u32 = 4;
/// errno for a device node whose hardware went away
const ENODEV: i32 = 19;

/// USB camera grabbing MJPG (preferred) or YUYV frames through mmap buffers.
pub struct V4lCamera {
    path: String,
    device: Device,
    /// `None` after a failed read until the next read rebuilds it
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4lCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let path = config.device_path();
        let unavailable = |e: io::Error| CaptureError::DeviceUnavailable {
            device: path.clone(),
            reason: e.to_string(),
        };

        let device = Device::new(config.device_index as usize).map_err(unavailable)?;

        // Most USB cameras compress on-board; fall back to raw YUYV otherwise
        let mjpg = FourCC::new(b"MJPG");
        let mut fmt = device
            .set_format(&Format::new(config.width, config.height, mjpg))
            .map_err(unavailable)?;
        if fmt.fourcc != mjpg {
            fmt = device
                .set_format(&Format::new(config.width, config.height, FourCC::new(b"YUYV")))
                .map_err(unavailable)?;
        }

        let format = match &fmt.fourcc.repr {
            b"MJPG" => PixelFormat::Mjpeg,
            b"YUYV" => PixelFormat::Yuyv,
            _ => {
                return Err(CaptureError::DeviceUnavailable {
                    device: path.clone(),
                    reason: format!("unsupported pixel format {}", fmt.fourcc),
                })
            }
        };

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!(device = %path, error = %e, "Failed to set frame rate");
        }

        let stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(unavailable)?;

        info!(
            device = %path,
            format = %fmt,
            "Camera opened"
        );

        Ok(Self {
            path,
            device,
            stream: Some(stream),
            width: fmt.width,
            height: fmt.height,
            format,
        })
    }

    /// Map a driver error from a frame read onto the capture taxonomy
    fn classify(e: &io::Error, timeout: Duration) -> CaptureError {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                CaptureError::CaptureTimeout(timeout)
            }
            _ if e.raw_os_error() == Some(ENODEV) => CaptureError::DeviceLost(e.to_string()),
            _ => CaptureError::Read(e.to_string()),
        }
    }

    /// A timed-out or failed dequeue leaves the mmap stream's current buffer
    /// queued, and re-queueing it makes every later read fail with EINVAL.
    /// Such errors need a fresh stream.
    fn needs_new_stream(err: &CaptureError) -> bool {
        matches!(err, CaptureError::CaptureTimeout(_) | CaptureError::Read(_))
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CaptureError> {
        if self.stream.is_none() {
            debug!(device = %self.path, "Restarting capture stream");
            let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)
                .map_err(|e| match e.raw_os_error() {
                    Some(ENODEV) => CaptureError::DeviceLost(e.to_string()),
                    _ => CaptureError::Read(format!("failed to restart stream: {}", e)),
                })?;
            self.stream = Some(stream);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| CaptureError::Read("capture stream missing".to_string()))
    }
}

impl FrameSource for V4lCamera {
    fn read_frame(&mut self, timeout: Duration) -> Result<RawFrame, CaptureError> {
        let stream = self.stream()?;
        stream.set_timeout(timeout);

        let data = match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                buf[..used].to_vec()
            }
            Err(e) => {
                let err = Self::classify(&e, timeout);
                if Self::needs_new_stream(&err) {
                    // Dropping the stream turns streaming off and frees the buffers
                    self.stream = None;
                }
                return Err(err);
            }
        };

        if data.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        debug!(device = %self.path, bytes = data.len(), "Frame read");

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            data,
            captured_at: SystemTime::now(),
        })
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} {:?})", self.path, self.width, self.height, self.format)
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        // Stream off before the device handle closes
        self.stream = None;
        info!(device = %self.path, "Camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_discards_stream() {
        let timeout = Duration::from_secs(2);
        let err = V4lCamera::classify(&io::Error::from(io::ErrorKind::TimedOut), timeout);

        assert_eq!(err, CaptureError::CaptureTimeout(timeout));
        assert!(V4lCamera::needs_new_stream(&err));
    }

    #[test]
    fn test_queue_error_discards_stream() {
        // EINVAL from re-queueing a buffer that is still queued
        let err = V4lCamera::classify(&io::Error::from_raw_os_error(22), Duration::from_secs(2));

        assert!(matches!(err, CaptureError::Read(_)));
        assert!(err.is_transient());
        assert!(V4lCamera::needs_new_stream(&err));
    }

    #[test]
    fn test_unplugged_device_is_lost() {
        let err = V4lCamera::classify(&io::Error::from_raw_os_error(ENODEV), Duration::from_secs(2));

        assert!(matches!(err, CaptureError::DeviceLost(_)));
        assert!(!V4lCamera::needs_new_stream(&err));
    }
}
