//! Capture → optional device transform → resize → JPEG.
//!
//! `FramePipeline::next()` is called once per delivered frame by every
//! stream connection and by snapshots. It reads the shared `PipelineMode` on
//! each call, so a toggle takes effect on the next tick; a frame already in
//! flight finishes in whichever mode it started.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::device::{DeviceChannel, DeviceError};
use crate::frame::{EncodedImage, Frame, FrameError, PixelLayout};
use crate::ingest::{CaptureError, FrameSource};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Process-wide "route frames through the transform device" flag.
///
/// Cloning yields another handle to the same flag. Starts disabled.
#[derive(Clone, Debug, Default)]
pub struct PipelineMode(Arc<AtomicBool>);

impl PipelineMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture failed: {0}")]
    CaptureFailed(#[from] CaptureError),

    #[error("transform failed: {0}")]
    TransformFailed(#[from] DeviceError),

    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

impl From<FrameError> for PipelineError {
    fn from(err: FrameError) -> Self {
        PipelineError::EncodeFailed(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Output size when the transform is off.
    pub display_width: u32,
    pub display_height: u32,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            display_width: 640,
            display_height: 480,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_encoded: u64,
    pub transformed_frames: u64,
    pub capture_failures: u64,
    pub transform_failures: u64,
    pub encode_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_encoded: AtomicU64,
    transformed_frames: AtomicU64,
    capture_failures: AtomicU64,
    transform_failures: AtomicU64,
    encode_failures: AtomicU64,
}

pub struct FramePipeline {
    source: Arc<FrameSource>,
    device: Arc<DeviceChannel>,
    mode: PipelineMode,
    config: PipelineConfig,
    counters: Counters,
}

impl FramePipeline {
    pub fn new(
        source: Arc<FrameSource>,
        device: Arc<DeviceChannel>,
        mode: PipelineMode,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            device,
            mode,
            config,
            counters: Counters::default(),
        }
    }

    pub fn mode(&self) -> &PipelineMode {
        &self.mode
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    /// Produce the next deliverable image.
    pub fn next(&self) -> Result<EncodedImage, PipelineError> {
        let result = self.produce();
        let counter = match &result {
            Ok(_) => &self.counters.frames_encoded,
            Err(PipelineError::CaptureFailed(_)) => &self.counters.capture_failures,
            Err(PipelineError::TransformFailed(_)) => &self.counters.transform_failures,
            Err(PipelineError::EncodeFailed(_)) => &self.counters.encode_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn produce(&self) -> Result<EncodedImage, PipelineError> {
        let frame = self.source.capture()?;

        let output = if self.mode.is_enabled() {
            let (width, height) = self.device.dimensions();
            let gray = frame.into_gray()?.resize(width, height)?;
            let transformed = self.device.transform(gray)?;
            self.counters
                .transformed_frames
                .fetch_add(1, Ordering::Relaxed);
            transformed
        } else {
            frame.resize(self.config.display_width, self.config.display_height)?
        };

        encode_jpeg(output, self.config.jpeg_quality)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            transformed_frames: self.counters.transformed_frames.load(Ordering::Relaxed),
            capture_failures: self.counters.capture_failures.load(Ordering::Relaxed),
            transform_failures: self.counters.transform_failures.load(Ordering::Relaxed),
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Compress a frame as baseline JPEG.
pub fn encode_jpeg(frame: Frame, quality: u8) -> Result<EncodedImage, PipelineError> {
    let frame = frame.into_rgb();
    let color = match frame.layout {
        PixelLayout::Gray8 => ExtendedColorType::L8,
        _ => ExtendedColorType::Rgb8,
    };
    let (width, height) = (frame.width, frame.height);
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(frame.as_bytes(), width, height, color)
        .map_err(|err| PipelineError::EncodeFailed(err.to_string()))?;
    Ok(EncodedImage::new(out.into_inner(), width, height))
}
