//! rollcall-hw: Camera capture for the recognition loop.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] trait and
//! the RGB [`Frame`] type shared with frame consumers.

pub mod camera;
pub mod frame;

pub use camera::{CaptureSettings, Camera, CameraError, DeviceInfo, FrameSource, PixelFormat, V4lFrameSource};
pub use frame::{Frame, FrameError};
