//! Camera frame sources.
//!
//! This module provides `FrameSource`, the single entry point the pipeline
//! uses to pull frames from the camera:
//! - Synthetic camera (`stub://` device paths, development and tests)
//! - USB/CSI cameras via V4L2 (feature: ingest-v4l2)
//!
//! Every backend hands back a raw capture in its native pixel layout. The
//! source then:
//! - Drops padding channels and converts to a 3-channel color `Frame`
//! - Applies the configured orientation (vertical flip)
//! - Serializes all capture calls, since camera drivers are not proven safe
//!   for concurrent dequeue
//!
//! A backend that cannot be opened is a `FatalStartupError`; the daemon exits.
//! Per-frame failures after startup are `CaptureError`s and are retried by
//! the caller.

mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::frame::{Frame, FrameError};
pub use normalize::normalize_to_color;
pub use synthetic::{SyntheticCamera, SyntheticPattern};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Camera;

/// Pixel layout as delivered by the sensor driver, named after the DRM
/// fourcc convention (little-endian words).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawPixelFormat {
    /// 32-bit words, memory order R, G, B, X.
    Xbgr8888,
    /// 32-bit words, memory order B, G, R, X.
    Xrgb8888,
    Rgb24,
    Bgr24,
    /// 8-bit Y plane followed by interleaved half-resolution UV.
    Nv12,
}

impl RawPixelFormat {
    /// Bytes per row with no padding. For NV12 this is the Y row, which is
    /// also the length of an interleaved UV row.
    pub fn packed_stride(self, width: u32) -> Option<usize> {
        let width = width as usize;
        match self {
            RawPixelFormat::Xbgr8888 | RawPixelFormat::Xrgb8888 => width.checked_mul(4),
            RawPixelFormat::Rgb24 | RawPixelFormat::Bgr24 => width.checked_mul(3),
            RawPixelFormat::Nv12 => Some(width),
        }
    }

    /// Rows in the buffer, counting the NV12 chroma rows.
    pub fn buffer_rows(self, height: u32) -> usize {
        let height = height as usize;
        match self {
            RawPixelFormat::Nv12 => height + height / 2,
            _ => height,
        }
    }

    /// Expected raw buffer length for a tightly packed frame.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        self.packed_stride(width)?
            .checked_mul(self.buffer_rows(height))
    }
}

impl fmt::Display for RawPixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RawPixelFormat::Xbgr8888 => "xbgr8888",
            RawPixelFormat::Xrgb8888 => "xrgb8888",
            RawPixelFormat::Rgb24 => "rgb24",
            RawPixelFormat::Bgr24 => "bgr24",
            RawPixelFormat::Nv12 => "nv12",
        };
        f.write_str(name)
    }
}

impl FromStr for RawPixelFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xbgr8888" => Ok(RawPixelFormat::Xbgr8888),
            "xrgb8888" => Ok(RawPixelFormat::Xrgb8888),
            "rgb24" => Ok(RawPixelFormat::Rgb24),
            "bgr24" => Ok(RawPixelFormat::Bgr24),
            "nv12" => Ok(RawPixelFormat::Nv12),
            other => Err(format!("unknown pixel format '{other}'")),
        }
    }
}

/// Configuration for the camera.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0"), or `stub://...` for the synthetic camera.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: RawPixelFormat,
    /// Sensor mounted upside down.
    pub vflip: bool,
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            width: 1920,
            height: 1080,
            format: RawPixelFormat::Xbgr8888,
            vflip: true,
            target_fps: 30,
        }
    }
}

/// One frame exactly as the driver produced it.
pub struct RawCapture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: RawPixelFormat,
    /// Bytes from the start of one row to the next (V4L2 `bytesperline`).
    /// Equal to the packed stride unless the driver pads rows.
    pub stride: usize,
}

#[derive(Debug, Error)]
pub enum FatalStartupError {
    #[error("camera backend unavailable on {device}: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("camera device {0} requires the ingest-v4l2 feature")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera capture failed: {0}")]
    Backend(String),

    #[error("raw {format} frame length mismatch: expected {expected}, got {actual}")]
    RawLength {
        format: RawPixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("camera frame malformed: {0}")]
    Malformed(#[from] FrameError),
}

/// A camera driver. Implementations block in `capture_raw` until the sensor
/// has a new frame.
pub trait CameraBackend: Send {
    fn capture_raw(&mut self) -> Result<RawCapture, CaptureError>;

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub device: String,
}

/// Serialized access to the camera plus normalization to a color `Frame`.
pub struct FrameSource {
    backend: Mutex<Box<dyn CameraBackend>>,
    vflip: bool,
    device: String,
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
}

impl FrameSource {
    /// Open the camera named by `config.device`.
    pub fn open(config: &CameraConfig) -> Result<Self, FatalStartupError> {
        let backend: Box<dyn CameraBackend> = if config.device.starts_with("stub://") {
            Box::new(SyntheticCamera::new(config.clone()))
        } else {
            open_device_backend(config)?
        };
        log::info!(
            "FrameSource: opened {} ({}x{} {}, vflip={})",
            backend.describe(),
            config.width,
            config.height,
            config.format,
            config.vflip
        );
        Ok(Self::with_backend(backend, config.vflip))
    }

    /// Wrap an already-connected backend.
    pub fn with_backend(backend: Box<dyn CameraBackend>, vflip: bool) -> Self {
        let device = backend.describe();
        Self {
            backend: Mutex::new(backend),
            vflip,
            device,
            frames_captured: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
        }
    }

    /// Capture one frame and normalize it to 3-channel color.
    pub fn capture(&self) -> Result<Frame, CaptureError> {
        let raw = {
            let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
            backend.capture_raw()
        };
        let frame = raw.and_then(|raw| {
            let frame = normalize_to_color(&raw)?;
            if self.vflip {
                Ok(frame.flip_vertical()?)
            } else {
                Ok(frame)
            }
        });
        match &frame {
            Ok(_) => self.frames_captured.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.capture_failures.fetch_add(1, Ordering::Relaxed),
        };
        frame
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            device: self.device.clone(),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device_backend(config: &CameraConfig) -> Result<Box<dyn CameraBackend>, FatalStartupError> {
    let mut camera = V4l2Camera::new(config.clone());
    camera.connect()?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device_backend(config: &CameraConfig) -> Result<Box<dyn CameraBackend>, FatalStartupError> {
    Err(FatalStartupError::Unsupported(config.device.clone()))
}
