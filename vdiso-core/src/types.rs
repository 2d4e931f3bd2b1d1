//! Shared types used across the display, relay and input modules.
//!
//! [`RawFrame`] is a strided buffer as produced by the virtual output or
//! read back from a GPU surface. [`Bitmap`] is the tightly packed image
//! handed to callers after padding has been trimmed.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::VdError;

// ── DisplayId ────────────────────────────────────────────────────

/// Opaque platform id of a virtual display. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(i32);

impl DisplayId {
    /// Wrap a raw id; returns `None` for the default display (0) or
    /// negative values.
    pub fn new(raw: i32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Clock ────────────────────────────────────────────────────────

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    *CLOCK_ORIGIN.get_or_init(Instant::now)
}

/// Milliseconds on the process-wide monotonic clock used for event
/// timestamps (down time, event time).
pub fn uptime_ms() -> u64 {
    origin().elapsed().as_millis() as u64
}

/// Nanoseconds on the same clock; used for presentation timestamps.
pub fn uptime_ns() -> u64 {
    origin().elapsed().as_nanos() as u64
}

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for frames moving through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ── RawFrame ─────────────────────────────────────────────────────

/// A strided, uncompressed frame.
///
/// The `data` buffer holds `height` rows of `stride` bytes each. `stride`
/// may be larger than `width * bytes_per_pixel` because producers and
/// read-back surfaces pad rows to their own alignment.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Monotonic timestamp of the frame.
    pub timestamp: Instant,
}

impl RawFrame {
    /// Allocate a zeroed frame with the given row pitch.
    pub fn zeroed(width: u32, height: u32, stride: u32) -> Self {
        Self {
            width,
            height,
            stride,
            format: PixelFormat::Rgba8,
            data: vec![0; stride as usize * height as usize],
            timestamp: Instant::now(),
        }
    }

    /// Check that `stride` covers a full row and `data` covers every row.
    pub fn validate(&self) -> Result<(), VdError> {
        if self.width == 0 || self.height == 0 {
            return Err(VdError::InvalidFrame(format!("empty {}x{}", self.width, self.height)));
        }
        let row_bytes = self.width as usize * self.format.bytes_per_pixel();
        if (self.stride as usize) < row_bytes {
            return Err(VdError::InvalidFrame(format!(
                "stride {} below row size {row_bytes}",
                self.stride
            )));
        }
        if self.data.len() < self.byte_len() {
            return Err(VdError::InvalidFrame(format!(
                "{} bytes for {} rows of {}",
                self.data.len(),
                self.height,
                self.stride
            )));
        }
        Ok(())
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.stride as usize;
        &self.data[start..end]
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Copy out the visible `width × height` region, dropping row padding.
    ///
    /// Walks the buffer by `stride`; it never assumes `stride` equals
    /// `width * bpp`.
    pub fn to_bitmap(&self) -> Bitmap {
        let row_bytes = self.width as usize * self.format.bytes_per_pixel();
        let mut pixels = Vec::with_capacity(row_bytes * self.height as usize);
        for y in 0..self.height {
            pixels.extend_from_slice(&self.row(y)[..row_bytes]);
        }
        Bitmap {
            width: self.width,
            height: self.height,
            format: self.format,
            pixels,
        }
    }
}

// ── Bitmap ───────────────────────────────────────────────────────

/// A tightly packed image: exactly `width * height * bpp` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Returns the pixel bytes at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = (y as usize * self.width as usize + x as usize) * bpp;
        &self.pixels[offset..offset + bpp]
    }

    /// Heuristic used by settled captures: samples a 32×32 grid and calls
    /// the image black unless at least 20 samples have a channel above 10.
    pub fn is_likely_black(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return true;
        }
        let step_x = (self.width / 32).max(1);
        let step_y = (self.height / 32).max(1);
        let mut non_black = 0;

        for y in (0..self.height).step_by(step_y as usize) {
            for x in (0..self.width).step_by(step_x as usize) {
                let p = self.pixel(x, y);
                if p[0] > 10 || p[1] > 10 || p[2] > 10 {
                    non_black += 1;
                    if non_black >= 20 {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Sleep helper for blocking loops that must not spin.
pub(crate) fn sleep_until(deadline: Instant, max_step: Duration) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep((deadline - now).min(max_step));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_id_rejects_default_display() {
        assert!(DisplayId::new(0).is_none());
        assert!(DisplayId::new(-3).is_none());
        assert_eq!(DisplayId::new(7).map(DisplayId::get), Some(7));
    }

    #[test]
    fn to_bitmap_trims_row_padding() {
        // 3 px wide = 12 bytes per row, padded to 16.
        let mut frame = RawFrame::zeroed(3, 2, 16);
        for y in 0..2 {
            let row = &mut frame.data[y * 16..(y + 1) * 16];
            row[..12].fill(0x11);
            row[12..].fill(0xEE);
        }
        let bmp = frame.to_bitmap();
        assert_eq!(bmp.pixels.len(), 3 * 2 * 4);
        assert!(bmp.pixels.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn black_detection() {
        let black = Bitmap {
            width: 64,
            height: 64,
            format: PixelFormat::Rgba8,
            pixels: vec![0; 64 * 64 * 4],
        };
        assert!(black.is_likely_black());

        let white = Bitmap {
            pixels: vec![0xFF; 64 * 64 * 4],
            ..black
        };
        assert!(!white.is_likely_black());
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(12, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }
}
