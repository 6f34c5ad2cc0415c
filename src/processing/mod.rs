//! Frame encoding: raw camera frames to transport-ready JPEG

use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, RgbImage};

use crate::camera::{CaptureError, PixelFormat, RawFrame};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Stateless JPEG encoder. Device-compressed MJPEG frames pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: RawFrame) -> Result<Bytes, CaptureError> {
        match frame.format {
            PixelFormat::Mjpeg => {
                if !frame.data.starts_with(&JPEG_SOI) {
                    return Err(CaptureError::Encode(
                        "MJPEG frame is missing the JPEG start marker".to_string(),
                    ));
                }
                Ok(Bytes::from(frame.data))
            }
            PixelFormat::Rgb24 => self.encode_rgb(frame.data, frame.width, frame.height),
            PixelFormat::Yuyv => {
                let rgb = yuyv_to_rgb(&frame.data, frame.width, frame.height)?;
                self.encode_rgb(rgb, frame.width, frame.height)
            }
        }
    }

    fn encode_rgb(&self, mut rgb: Vec<u8>, width: u32, height: u32) -> Result<Bytes, CaptureError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() < expected {
            return Err(CaptureError::Encode(format!(
                "short RGB frame: {} bytes, expected {}",
                rgb.len(),
                expected
            )));
        }
        rgb.truncate(expected);

        let img = RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| CaptureError::Encode("frame does not fit its dimensions".to_string()))?;

        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&img)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        Ok(Bytes::from(out))
    }
}

/// Convert packed YUYV 4:2:2 to RGB24 (BT.601, limited range).
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let pixels = width as usize * height as usize;
    if width % 2 != 0 || yuyv.len() < pixels * 2 {
        return Err(CaptureError::Encode(format!(
            "short YUYV frame: {} bytes for {}x{}",
            yuyv.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}
