//! Synthetic camera for `stub://` device paths.
//!
//! `stub://solid:<value>` fills every color sample with `value`; any other
//! `stub://` path produces a diagonal gradient that shifts one step per frame.
//! Frames are emitted in the configured raw layout so the normalization path
//! is exercised exactly as with a real sensor, and are paced to `target_fps`.

use std::time::{Duration, Instant};

use super::{CameraBackend, CameraConfig, CaptureError, RawCapture, RawPixelFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticPattern {
    Gradient,
    Solid(u8),
}

impl SyntheticPattern {
    pub fn from_device(device: &str) -> Self {
        device
            .strip_prefix("stub://solid:")
            .and_then(|value| value.parse().ok())
            .map(SyntheticPattern::Solid)
            .unwrap_or(SyntheticPattern::Gradient)
    }
}

pub struct SyntheticCamera {
    config: CameraConfig,
    pattern: SyntheticPattern,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        let pattern = SyntheticPattern::from_device(&config.device);
        Self::with_pattern(config, pattern)
    }

    pub fn with_pattern(config: CameraConfig, pattern: SyntheticPattern) -> Self {
        Self {
            config,
            pattern,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn sample(&self, x: usize, y: usize) -> u8 {
        match self.pattern {
            SyntheticPattern::Solid(value) => value,
            SyntheticPattern::Gradient => ((x + y) as u64 + self.frame_count) as u8,
        }
    }

    fn generate(&self) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let format = self.config.format;
        let capacity = format
            .frame_len(self.config.width, self.config.height)
            .unwrap_or(0);
        let mut out = Vec::with_capacity(capacity);
        match format {
            RawPixelFormat::Xbgr8888 | RawPixelFormat::Xrgb8888 => {
                for y in 0..h {
                    for x in 0..w {
                        let v = self.sample(x, y);
                        out.extend_from_slice(&[v, v, v, 0xFF]);
                    }
                }
            }
            RawPixelFormat::Rgb24 | RawPixelFormat::Bgr24 => {
                for y in 0..h {
                    for x in 0..w {
                        let v = self.sample(x, y);
                        out.extend_from_slice(&[v, v, v]);
                    }
                }
            }
            RawPixelFormat::Nv12 => {
                for y in 0..h {
                    for x in 0..w {
                        out.push(self.sample(x, y));
                    }
                }
                out.resize(out.len() + w * h / 2, 128);
            }
        }
        out
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.target_fps;
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl CameraBackend for SyntheticCamera {
    fn capture_raw(&mut self) -> Result<RawCapture, CaptureError> {
        self.pace();
        self.frame_count += 1;
        Ok(RawCapture {
            data: self.generate(),
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            stride: self
                .config
                .format
                .packed_stride(self.config.width)
                .unwrap_or(0),
        })
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.device)
    }
}
