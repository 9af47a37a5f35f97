//! Latest frame and recognition status, shared between the loop and callers.

use std::sync::{Mutex, RwLock};

use rollcall_hw::Frame;
use serde::Serialize;

pub const WAITING_MESSAGE: &str = "Waiting for recognition...";
pub const CAMERA_UNAVAILABLE_MESSAGE: &str = "Camera not accessible";

/// Most recent human-facing recognition result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionStatus {
    pub name: String,
    pub reference_image_uri: String,
    pub status_message: String,
}

impl RecognitionStatus {
    pub fn waiting() -> Self {
        Self::message(WAITING_MESSAGE)
    }

    /// A status with no identity attached.
    pub fn message(text: &str) -> Self {
        Self {
            name: String::new(),
            reference_image_uri: String::new(),
            status_message: text.to_string(),
        }
    }
}

impl Default for RecognitionStatus {
    fn default() -> Self {
        Self::waiting()
    }
}

/// Single-slot buffers, overwritten on every write.
///
/// Both slots are only locked long enough to copy in or out.
pub struct StatusBuffer {
    frame: Mutex<Option<Frame>>,
    status: RwLock<RecognitionStatus>,
}

impl StatusBuffer {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            status: RwLock::new(RecognitionStatus::waiting()),
        }
    }

    pub fn publish_frame(&self, frame: &Frame) {
        let copy = frame.clone();
        *self.frame.lock().unwrap_or_else(|p| p.into_inner()) = Some(copy);
    }

    /// Independent copy of the latest frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.frame.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_status(&self, status: RecognitionStatus) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    pub fn status(&self) -> RecognitionStatus {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn reset_status(&self) {
        self.set_status(RecognitionStatus::waiting());
    }
}

impl Default for StatusBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(value: u8, sequence: u32) -> Frame {
        Frame::from_image(RgbImage::from_pixel(4, 4, image::Rgb([value; 3])), sequence)
    }

    #[test]
    fn test_starts_waiting_without_frame() {
        let buffer = StatusBuffer::new();
        assert!(buffer.latest_frame().is_none());
        assert_eq!(buffer.status().status_message, WAITING_MESSAGE);
        assert!(buffer.status().name.is_empty());
    }

    #[test]
    fn test_latest_frame_is_isolated_copy() {
        let buffer = StatusBuffer::new();
        buffer.publish_frame(&frame(10, 1));

        let mut copy = buffer.latest_frame().unwrap();
        copy.data.iter_mut().for_each(|b| *b = 255);
        copy.sequence = 99;

        let again = buffer.latest_frame().unwrap();
        assert!(again.data.iter().all(|&b| b == 10));
        assert_eq!(again.sequence, 1);
    }

    #[test]
    fn test_frame_slot_overwrites() {
        let buffer = StatusBuffer::new();
        buffer.publish_frame(&frame(1, 1));
        buffer.publish_frame(&frame(2, 2));
        assert_eq!(buffer.latest_frame().unwrap().sequence, 2);
    }

    #[test]
    fn test_reset_status() {
        let buffer = StatusBuffer::new();
        buffer.set_status(RecognitionStatus {
            name: "Ada".into(),
            reference_image_uri: "http://img/ada.jpg".into(),
            status_message: "Marked".into(),
        });
        assert_eq!(buffer.status().name, "Ada");

        buffer.reset_status();
        assert_eq!(buffer.status(), RecognitionStatus::waiting());
    }
}
