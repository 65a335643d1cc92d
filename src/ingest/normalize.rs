use std::borrow::Cow;

use super::{CaptureError, RawCapture, RawPixelFormat};
use crate::frame::{Frame, FrameError, PixelLayout};

/// Convert a raw driver buffer into a plain 3-channel color frame.
///
/// Padded 32-bit layouts have their X byte dropped; the channel order is
/// kept (no swizzle) and recorded in the frame layout instead. Rows padded
/// past the packed width (`stride` larger than the packed stride) are
/// compacted first.
pub fn normalize_to_color(raw: &RawCapture) -> Result<Frame, CaptureError> {
    let (width, height, format) = (raw.width, raw.height, raw.format);
    if format == RawPixelFormat::Nv12 && (width % 2 != 0 || height % 2 != 0) {
        return Err(CaptureError::Backend(format!(
            "nv12 needs even dimensions, got {width}x{height}"
        )));
    }
    let pixels = packed_rows(raw)?;

    let frame = match format {
        RawPixelFormat::Xbgr8888 => {
            Frame::new(strip_padding(&pixels), width, height, PixelLayout::Rgb8)?
        }
        RawPixelFormat::Xrgb8888 => {
            Frame::new(strip_padding(&pixels), width, height, PixelLayout::Bgr8)?
        }
        RawPixelFormat::Rgb24 => Frame::new(pixels.into_owned(), width, height, PixelLayout::Rgb8)?,
        RawPixelFormat::Bgr24 => Frame::new(pixels.into_owned(), width, height, PixelLayout::Bgr8)?,
        RawPixelFormat::Nv12 => Frame::new(
            nv12_to_rgb(&pixels, width, height),
            width,
            height,
            PixelLayout::Rgb8,
        )?,
    };
    Ok(frame)
}

/// Returns the buffer with row padding removed, borrowing when the rows
/// are already packed.
fn packed_rows(raw: &RawCapture) -> Result<Cow<'_, [u8]>, CaptureError> {
    let (width, height, format) = (raw.width, raw.height, raw.format);
    let overflow = || FrameError::DimensionsOverflow { width, height };
    let row_len = format.packed_stride(width).ok_or_else(overflow)?;
    let rows = format.buffer_rows(height);
    if raw.stride < row_len {
        return Err(CaptureError::Backend(format!(
            "{format} stride {} shorter than a {width}-pixel row",
            raw.stride
        )));
    }

    // The last row may stop at the packed width.
    let expected = match rows {
        0 => 0,
        rows => raw
            .stride
            .checked_mul(rows - 1)
            .and_then(|len| len.checked_add(row_len))
            .ok_or_else(overflow)?,
    };
    let padded_full = raw.stride.checked_mul(rows);
    if raw.data.len() != expected && Some(raw.data.len()) != padded_full {
        return Err(CaptureError::RawLength {
            format,
            expected,
            actual: raw.data.len(),
        });
    }

    if raw.stride == row_len {
        return Ok(Cow::Borrowed(&raw.data[..expected]));
    }
    let mut packed = Vec::with_capacity(row_len * rows);
    for row in raw.data.chunks(raw.stride).take(rows) {
        packed.extend_from_slice(&row[..row_len]);
    }
    Ok(Cow::Owned(packed))
}

fn strip_padding(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 4 * 3);
    for px in pixels.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    out
}

// Length already validated by the caller.
fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }
    rgb
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
