//! Synthetic camera producing a moving colour bar pattern

use std::time::{Duration, SystemTime};

use super::{CaptureError, FrameSource, PixelFormat, RawFrame};
use crate::config::CameraConfig;

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Stand-in for a USB camera. Always "connected", never times out.
pub struct TestPatternSource {
    device_index: u32,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl TestPatternSource {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            device_index: config.device_index,
            width: config.width,
            height: config.height,
            frame_count: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![0u8; w * h * 3];
        let bar_width = (w / BARS.len()).max(1);
        // Scrolls one bar width per second at 30 fps
        let offset = (self.frame_count as usize * bar_width / 30) % w.max(1);
        // White scan line marks the frame number
        let marker_row = (self.frame_count as usize) % h.max(1);

        for (y, row) in pixels.chunks_exact_mut(w * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let colour = if y == marker_row {
                    [255, 255, 255]
                } else {
                    BARS[((x + offset) / bar_width) % BARS.len()]
                };
                px.copy_from_slice(&colour);
            }
        }

        pixels
    }
}

impl FrameSource for TestPatternSource {
    fn read_frame(&mut self, _timeout: Duration) -> Result<RawFrame, CaptureError> {
        let data = self.render();
        self.frame_count += 1;

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgb24,
            data,
            captured_at: SystemTime::now(),
        })
    }

    fn describe(&self) -> String {
        format!(
            "test-pattern:{} ({}x{})",
            self.device_index, self.width, self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_change_over_time() {
        let config = CameraConfig {
            width: 64,
            height: 48,
            ..Default::default()
        };
        let mut source = TestPatternSource::new(&config);

        let first = source.read_frame(Duration::from_secs(1)).unwrap();
        let second = source.read_frame(Duration::from_secs(1)).unwrap();

        assert_eq!(first.width, 64);
        assert_eq!(first.height, 48);
        assert_eq!(first.data.len(), 64 * 48 * 3);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_tiny_frame() {
        let config = CameraConfig {
            width: 1,
            height: 1,
            ..Default::default()
        };
        let mut source = TestPatternSource::new(&config);
        let frame = source.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.data.len(), 3);
    }
}
