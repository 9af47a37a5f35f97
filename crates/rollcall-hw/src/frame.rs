//! Frame type and pixel conversions: YUYV to RGB, resizing and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap an RGB image captured now.
    pub fn from_image(image: RgbImage, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Borrowed view as an `RgbImage` (copies the pixel buffer).
    pub fn to_image(&self) -> Result<RgbImage, FrameError> {
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(FrameError::InvalidLength {
            expected: (self.width * self.height * 3) as usize,
            actual: self.data.len(),
        })
    }

    /// Resize to exactly `width` x `height`.
    pub fn resized(&self, width: u32, height: u32) -> Result<RgbImage, FrameError> {
        let image = self.to_image()?;
        if image.dimensions() == (width, height) {
            return Ok(image);
        }
        Ok(imageops::resize(&image, width, height, FilterType::Triangle))
    }

    /// JPEG-encode the frame at `width` x `height`.
    pub fn encode_jpeg(&self, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, FrameError> {
        let image = self.resized(width, height)?;
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&image)?;
        Ok(out)
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.data.len() / 3;
        if pixels == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .data
            .chunks_exact(3)
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / pixels as f32
    }
}

/// Convert packed YUYV (4:2:2) to RGB8 using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        Frame::from_image(RgbImage::from_pixel(width, height, image::Rgb(rgb)), 1)
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        let yuyv = vec![100, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[128, 128, 128, 228], 2, 1).unwrap();
        assert!(rgb[0] > 200);
        assert!(rgb[1] < 100);
        assert_eq!(rgb[2], 128);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[1, 2], 2, 1).is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let original = solid(4, 4, [10, 20, 30]);
        let mut copy = original.clone();
        copy.data[0] = 255;
        assert_eq!(original.data[0], 10);
    }

    #[test]
    fn test_resized_dimensions() {
        let frame = solid(320, 240, [0, 0, 0]);
        assert_eq!(frame.resized(160, 120).unwrap().dimensions(), (160, 120));
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg() {
        let frame = solid(32, 24, [200, 100, 50]);
        let jpeg = frame.encode_jpeg(48, 36, 60).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_to_image_rejects_short_buffer() {
        let mut frame = solid(4, 4, [0, 0, 0]);
        frame.data.truncate(10);
        assert!(frame.to_image().is_err());
    }

    #[test]
    fn test_avg_brightness() {
        assert!((solid(2, 2, [255, 255, 255]).avg_brightness() - 255.0).abs() < 0.1);
        assert_eq!(solid(2, 2, [0, 0, 0]).avg_brightness(), 0.0);
    }
}
