//! V4L2 camera backend.
//!
//! Opens a local device node (e.g. /dev/video0), negotiates the configured
//! resolution and pixel format, and dequeues frames from an mmap stream.
//! If the driver refuses the requested format, the format it reports is
//! used as long as this crate can normalize it.

use ouroboros::self_referencing;
use std::time::Instant;

use super::{
    CameraBackend, CameraConfig, CaptureError, FatalStartupError, RawCapture, RawPixelFormat,
};

pub struct V4l2Camera {
    config: CameraConfig,
    state: Option<V4l2State>,
    active_width: u32,
    active_height: u32,
    active_format: RawPixelFormat,
    active_stride: usize,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn fourcc_for(format: RawPixelFormat) -> v4l::FourCC {
    match format {
        RawPixelFormat::Xbgr8888 => v4l::FourCC::new(b"XB24"),
        RawPixelFormat::Xrgb8888 => v4l::FourCC::new(b"XR24"),
        RawPixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
        RawPixelFormat::Bgr24 => v4l::FourCC::new(b"BGR3"),
        RawPixelFormat::Nv12 => v4l::FourCC::new(b"NV12"),
    }
}

fn format_for(fourcc: v4l::FourCC) -> Option<RawPixelFormat> {
    match &fourcc.repr {
        b"XB24" => Some(RawPixelFormat::Xbgr8888),
        b"XR24" => Some(RawPixelFormat::Xrgb8888),
        b"RGB3" => Some(RawPixelFormat::Rgb24),
        b"BGR3" => Some(RawPixelFormat::Bgr24),
        b"NV12" => Some(RawPixelFormat::Nv12),
        _ => None,
    }
}

/// Row stride as the driver reports it (`bytesperline`). Zero means the
/// driver left it unset, which V4L2 defines as packed rows.
fn stride_for(format: RawPixelFormat, width: u32, bytesperline: u32) -> usize {
    let packed = format.packed_stride(width).unwrap_or(0);
    match bytesperline as usize {
        0 => packed,
        stride => stride.max(packed),
    }
}

impl V4l2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            active_format: config.format,
            active_stride: config.format.packed_stride(config.width).unwrap_or(0),
            config,
            state: None,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> FatalStartupError {
        FatalStartupError::Unavailable {
            device: self.config.device.clone(),
            reason: reason.to_string(),
        }
    }

    /// Open the device and start streaming.
    pub fn connect(&mut self) -> Result<(), FatalStartupError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .map_err(|err| self.unavailable(format!("open: {err}")))?;
        let mut format = device
            .format()
            .map_err(|err| self.unavailable(format!("read format: {err}")))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = fourcc_for(self.config.format);

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .map_err(|err| self.unavailable(format!("read format: {err}")))?
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Camera: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_format = format_for(format.fourcc)
            .ok_or_else(|| self.unavailable(format!("unsupported fourcc {}", format.fourcc)))?;
        self.active_width = format.width;
        self.active_height = format.height;
        self.active_stride = stride_for(self.active_format, format.width, format.stride);

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
            },
        }
        .try_build()
        .map_err(|err| self.unavailable(format!("create buffer stream: {err}")))?;
        self.state = Some(state);

        log::info!(
            "V4l2Camera: connected to {} ({}x{} {}, {} bytes per line)",
            self.config.device,
            self.active_width,
            self.active_height,
            self.active_format,
            self.active_stride
        );
        Ok(())
    }
}

impl CameraBackend for V4l2Camera {
    fn capture_raw(&mut self) -> Result<RawCapture, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Backend("v4l2 device not connected".to_string()))?;
        let data = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| CaptureError::Backend(format!("dequeue v4l2 frame: {err}")))?;

        self.frame_count += 1;
        if let Some(last) = self.last_frame_at {
            log::debug!(
                "V4l2Camera: frame {} after {:?}",
                self.frame_count,
                last.elapsed()
            );
        }
        self.last_frame_at = Some(Instant::now());

        // Drivers may pad the final buffer past the last row; keep exactly
        // one frame of strided rows.
        let mut data = data;
        let rows = self.active_format.buffer_rows(self.active_height);
        if let Some(len) = self.active_stride.checked_mul(rows) {
            data.truncate(len);
        }

        Ok(RawCapture {
            data,
            width: self.active_width,
            height: self.active_height,
            format: self.active_format,
            stride: self.active_stride,
        })
    }

    fn describe(&self) -> String {
        self.config.device.clone()
    }
}
