//! Hardware transform device.
//!
//! The accelerator is a byte pipe with one control register:
//! - write exactly `width * height` grayscale bytes,
//! - read back exactly `width * height` transformed bytes,
//! - out of band, an ioctl switches the transform on or off.
//!
//! There is no framing and no request multiplexing, so `DeviceChannel` holds
//! a single mutex over every device operation. A mode change can never
//! interleave with an in-flight write/read pair.
//!
//! Backends:
//! - `CharDevice`: the real character device (Linux).
//! - `LoopbackDevice`: in-process echo for `stub://` paths.

#[cfg(target_os = "linux")]
pub mod chardev;
pub mod loopback;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::frame::{Frame, PixelLayout};
#[cfg(target_os = "linux")]
pub use chardev::CharDevice;
pub use loopback::{LoopbackCounters, LoopbackDevice};

/// `_IOW('e', 1, int)`: the driver's enable/disable command.
pub const IOCTL_SET_EDGE_DETECTION: u32 = 0x4004_6501;

/// Width and height the reference driver is built for.
pub const DEVICE_WIDTH: u32 = 640;
pub const DEVICE_HEIGHT: u32 = 480;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transform device {path} unavailable: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transform device rejected mode change: {0}")]
    ControlRejected(#[source] std::io::Error),

    #[error("short write to transform device: {written} of {expected} bytes")]
    ShortWrite {
        expected: usize,
        written: usize,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("short read from transform device: {read} of {expected} bytes")]
    ShortRead {
        expected: usize,
        read: usize,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("transform device did not respond within {0:?}")]
    Timeout(Duration),

    #[error("transform input must be {expected}, got {actual}")]
    InvalidInput { expected: String, actual: String },
}

/// Configuration for the transform device.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device node (e.g. "/dev/edge_detection"), or `stub://...` for loopback.
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub ioctl_command: u32,
    /// Upper bound on one whole write-then-read exchange with the device.
    pub timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/edge_detection".to_string(),
            width: DEVICE_WIDTH,
            height: DEVICE_HEIGHT,
            ioctl_command: IOCTL_SET_EDGE_DETECTION,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Raw device protocol. Each call is one complete session: implementations
/// open, use and release the device within the call.
pub trait TransformDevice: Send {
    fn set_mode(&mut self, enabled: bool) -> Result<(), DeviceError>;

    /// Submit one frame's bytes and return what the device produced.
    fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError>;
}

/// Serialized, geometry-checked access to a `TransformDevice`.
pub struct DeviceChannel {
    device: Mutex<Box<dyn TransformDevice>>,
    width: u32,
    height: u32,
}

impl DeviceChannel {
    /// Build the backend named by `config.path`. Nothing is opened yet.
    pub fn open(config: &DeviceConfig) -> Self {
        let device: Box<dyn TransformDevice> = if config.path.starts_with("stub://") {
            log::info!("DeviceChannel: using loopback device for {}", config.path);
            Box::new(LoopbackDevice::new())
        } else {
            platform_device(config)
        };
        Self::with_device(device, config.width, config.height)
    }

    pub fn with_device(device: Box<dyn TransformDevice>, width: u32, height: u32) -> Self {
        Self {
            device: Mutex::new(device),
            width,
            height,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device.set_mode(enabled)
    }

    /// Run one grayscale frame through the device.
    ///
    /// The result always has the device's fixed geometry; anything shorter is
    /// `ShortRead` and anything longer is truncated to one frame.
    pub fn transform(&self, input: Frame) -> Result<Frame, DeviceError> {
        if input.layout != PixelLayout::Gray8
            || input.width != self.width
            || input.height != self.height
        {
            return Err(DeviceError::InvalidInput {
                expected: format!("{}x{} Gray8", self.width, self.height),
                actual: format!("{}x{} {:?}", input.width, input.height, input.layout),
            });
        }
        let expected = input.as_bytes().len();
        let mut output = {
            let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
            device.round_trip(input.as_bytes())?
        };
        if output.len() < expected {
            return Err(DeviceError::ShortRead {
                expected,
                read: output.len(),
                source: None,
            });
        }
        output.truncate(expected);
        Frame::new(output, self.width, self.height, PixelLayout::Gray8).map_err(|_| {
            DeviceError::ShortRead {
                expected,
                read: 0,
                source: None,
            }
        })
    }
}

#[cfg(target_os = "linux")]
fn platform_device(config: &DeviceConfig) -> Box<dyn TransformDevice> {
    Box::new(CharDevice::new(config))
}

#[cfg(not(target_os = "linux"))]
fn platform_device(config: &DeviceConfig) -> Box<dyn TransformDevice> {
    struct Unsupported(String);

    impl TransformDevice for Unsupported {
        fn set_mode(&mut self, _enabled: bool) -> Result<(), DeviceError> {
            Err(self.error())
        }

        fn round_trip(&mut self, _input: &[u8]) -> Result<Vec<u8>, DeviceError> {
            Err(self.error())
        }
    }

    impl Unsupported {
        fn error(&self) -> DeviceError {
            DeviceError::Unavailable {
                path: self.0.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "character devices require Linux",
                ),
            }
        }
    }

    Box::new(Unsupported(config.path.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TruncatingDevice(usize);

    impl TransformDevice for TruncatingDevice {
        fn set_mode(&mut self, _enabled: bool) -> Result<(), DeviceError> {
            Ok(())
        }

        fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError> {
            Ok(input[..input.len().min(self.0)].to_vec())
        }
    }

    fn gray(width: u32, height: u32, value: u8) -> Frame {
        Frame::filled(width, height, PixelLayout::Gray8, value).unwrap()
    }

    #[test]
    fn transform_returns_device_geometry() -> anyhow::Result<()> {
        let channel = DeviceChannel::open(&DeviceConfig {
            path: "stub://edge".to_string(),
            ..DeviceConfig::default()
        });
        let out = channel.transform(gray(640, 480, 77))?;
        assert_eq!((out.width, out.height), (640, 480));
        assert_eq!(out.layout, PixelLayout::Gray8);
        assert!(out.as_bytes().iter().all(|&v| v == 77));
        Ok(())
    }

    #[test]
    fn transform_rejects_wrong_geometry_without_touching_device() {
        let channel = DeviceChannel::with_device(Box::new(TruncatingDevice(0)), 640, 480);
        let err = channel.transform(gray(320, 240, 0)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidInput { .. }));

        let color = Frame::filled(640, 480, PixelLayout::Rgb8, 0).unwrap();
        assert!(matches!(
            channel.transform(color),
            Err(DeviceError::InvalidInput { .. })
        ));
    }

    #[test]
    fn truncated_output_is_short_read() {
        let channel = DeviceChannel::with_device(Box::new(TruncatingDevice(1000)), 640, 480);
        let err = channel.transform(gray(640, 480, 1)).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ShortRead {
                expected: 307_200,
                read: 1000,
                ..
            }
        ));
    }

    #[test]
    fn default_config_matches_driver() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.ioctl_command, 0x40046501);
        assert_eq!((cfg.width, cfg.height), (640, 480));
    }
}
