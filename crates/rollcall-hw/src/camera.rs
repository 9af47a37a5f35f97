//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no capture device opened (tried {0:?})")]
    NoDevice(Vec<usize>),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("camera not open")]
    NotOpen,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpeg,
}

/// Requested capture configuration. Kept small to bound latency and CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Driver-side buffer count; 1 keeps the newest frame closest to "now".
    pub buffers: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 15,
            buffers: 1,
        }
    }
}

/// Open V4L2 camera with a running mmap stream.
pub struct Camera {
    stream: MmapStream<'static>,
    // Declared after the stream so the stream is torn down first.
    _device: Device,
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video{index}` and start streaming with `settings`.
    pub fn open(index: usize, settings: &CaptureSettings) -> Result<Self, CameraError> {
        let path = device_path(index);
        if !Path::new(&path).exists() {
            return Err(CameraError::DeviceNotFound(path));
        }

        let device = Device::new(index).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureFailed(format!("{path} is not a capture device")));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = settings.width;
        fmt.height = settings.height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or MJPG)"
            )));
        };

        // Frame rate is advisory; some drivers reject it.
        if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
            tracing::warn!(device = %path, fps = settings.fps, error = %e, "could not set frame rate");
        }

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, settings.buffers.max(1))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = %path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            buffers = settings.buffers,
            "camera opened"
        );

        Ok(Self {
            stream,
            _device: device,
            index,
            width: negotiated.width,
            height: negotiated.height,
            fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next frame. `Ok(None)` means the driver handed back an
    /// empty buffer; callers should simply try again.
    pub fn capture_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(None);
        }
        let buf = &buf[..used];

        let rgb = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}")))?,
            PixelFormat::Mjpeg => {
                let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}")))?
                    .to_rgb8();
                if decoded.dimensions() != (self.width, self.height) {
                    return Err(CameraError::CaptureFailed(format!(
                        "MJPG frame is {:?}, expected {}x{}",
                        decoded.dimensions(),
                        self.width,
                        self.height
                    )));
                }
                decoded.into_raw()
            }
        };

        Ok(Some(Frame {
            data: rgb,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        }))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for index in 0..16 {
            let path = device_path(index);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::new(index) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                index,
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn device_path(index: usize) -> String {
    format!("/dev/video{index}")
}

/// Owner of the capture device, as seen by the recognition loop.
pub trait FrameSource: Send {
    /// Open the device. Fails if nothing can be opened.
    fn open(&mut self) -> Result<(), CameraError>;

    /// Next frame, `Ok(None)` for a transient empty read.
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Release the device. Safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// [`FrameSource`] over an ordered list of V4L2 device indices.
pub struct V4lFrameSource {
    indices: Vec<usize>,
    settings: CaptureSettings,
    camera: Option<Camera>,
}

impl V4lFrameSource {
    pub fn new(indices: Vec<usize>, settings: CaptureSettings) -> Self {
        Self {
            indices,
            settings,
            camera: None,
        }
    }
}

impl FrameSource for V4lFrameSource {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.camera.is_some() {
            return Ok(());
        }
        for &index in &self.indices {
            match Camera::open(index, &self.settings) {
                Ok(camera) => {
                    self.camera = Some(camera);
                    return Ok(());
                }
                Err(e) => tracing::debug!(index, error = %e, "camera candidate failed"),
            }
        }
        Err(CameraError::NoDevice(self.indices.clone()))
    }

    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        self.camera.as_mut().ok_or(CameraError::NotOpen)?.capture_frame()
    }

    fn close(&mut self) {
        if let Some(camera) = self.camera.take() {
            tracing::info!(index = camera.index, "camera released");
        }
    }

    fn is_open(&self) -> bool {
        self.camera.is_some()
    }
}
