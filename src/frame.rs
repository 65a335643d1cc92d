//! Owned pixel buffers that flow through the pipeline.
//!
//! - `Frame`: width, height and channel layout plus exactly
//!   `width * height * channels` bytes. Immutable once built; every stage
//!   consumes its input and produces a new frame.
//! - `EncodedImage`: a compressed still (JPEG) ready for the wire or disk.
//!
//! Luma conversion, resize and flips hand the frame bytes to
//! `image::imageops` as an `ImageBuffer` and take them back afterwards. Edge
//! detection belongs to the transform device.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use thiserror::Error;

/// Channel layout of a `Frame`. All layouts are 8 bits per sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Gray8,
    Rgb8,
    Bgr8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 | PixelLayout::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions {width}x{height} overflow")]
    DimensionsOverflow { width: u32, height: u32 },

    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("frame dimensions must be non-zero")]
    Empty,
}

/// Byte length of a frame with the given geometry.
pub fn frame_len(width: u32, height: u32, layout: PixelLayout) -> Result<usize, FrameError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(layout.channels()))
        .ok_or(FrameError::DimensionsOverflow { width, height })
}

/// One decoded image buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl std::fmt::Debug for Frame {
    // Never dump pixel bytes into logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = frame_len(width, height, layout)?;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
        })
    }

    /// A frame with every sample set to `value`.
    pub fn filled(
        width: u32,
        height: u32,
        layout: PixelLayout,
        value: u8,
    ) -> Result<Self, FrameError> {
        let len = frame_len(width, height, layout)?;
        Self::new(vec![value; len], width, height, layout)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    /// Convert to single-channel luma.
    pub fn into_gray(self) -> Result<Frame, FrameError> {
        let gray = match self.into_rgb().into_buffer()? {
            PixelBuffer::Gray(gray) => gray,
            PixelBuffer::Color(rgb) => imageops::grayscale(&rgb),
        };
        Frame::from_buffer(PixelBuffer::Gray(gray), PixelLayout::Gray8)
    }

    /// Bilinear (triangle filter) resize. Returns `self` untouched when the
    /// size already matches.
    pub fn resize(self, width: u32, height: u32) -> Result<Frame, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        if width == self.width && height == self.height {
            return Ok(self);
        }
        let layout = self.layout;
        let resized = match self.into_buffer()? {
            PixelBuffer::Gray(gray) => {
                PixelBuffer::Gray(imageops::resize(&gray, width, height, FilterType::Triangle))
            }
            PixelBuffer::Color(color) => {
                PixelBuffer::Color(imageops::resize(&color, width, height, FilterType::Triangle))
            }
        };
        Frame::from_buffer(resized, layout)
    }

    /// Mirror rows top to bottom.
    pub fn flip_vertical(self) -> Result<Frame, FrameError> {
        let layout = self.layout;
        let flipped = match self.into_buffer()? {
            PixelBuffer::Gray(mut gray) => {
                imageops::flip_vertical_in_place(&mut gray);
                PixelBuffer::Gray(gray)
            }
            PixelBuffer::Color(mut color) => {
                imageops::flip_vertical_in_place(&mut color);
                PixelBuffer::Color(color)
            }
        };
        Frame::from_buffer(flipped, layout)
    }

    /// Reorder BGR samples to RGB. Other layouts pass through.
    pub fn into_rgb(self) -> Frame {
        if self.layout != PixelLayout::Bgr8 {
            return self;
        }
        let mut data = self.data;
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Frame {
            data,
            layout: PixelLayout::Rgb8,
            ..self
        }
    }

    // 3-channel layouts share `RgbImage`; the ops used here are
    // channel-order agnostic.
    fn into_buffer(self) -> Result<PixelBuffer, FrameError> {
        let expected = frame_len(self.width, self.height, self.layout)?;
        let actual = self.data.len();
        let buffer = match self.layout {
            PixelLayout::Gray8 => {
                GrayImage::from_raw(self.width, self.height, self.data).map(PixelBuffer::Gray)
            }
            PixelLayout::Rgb8 | PixelLayout::Bgr8 => {
                RgbImage::from_raw(self.width, self.height, self.data).map(PixelBuffer::Color)
            }
        };
        buffer.ok_or(FrameError::LengthMismatch { expected, actual })
    }

    fn from_buffer(buffer: PixelBuffer, layout: PixelLayout) -> Result<Frame, FrameError> {
        match buffer {
            PixelBuffer::Gray(gray) => {
                let (width, height) = gray.dimensions();
                Frame::new(gray.into_raw(), width, height, layout)
            }
            PixelBuffer::Color(color) => {
                let (width, height) = color.dimensions();
                Frame::new(color.into_raw(), width, height, layout)
            }
        }
    }
}

enum PixelBuffer {
    Gray(GrayImage),
    Color(RgbImage),
}

/// A compressed still image.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedImage")
            .field("len", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl EncodedImage {
    pub fn new(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            width,
            height,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
