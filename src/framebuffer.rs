//! Strided RGB565 pixel buffers.
//!
//! The GPU hands us rows that may be padded past the visible width, so every
//! buffer keeps a row stride (in pixels) separate from its logical width.

use crate::error::{MirrorError, MirrorResult};

/// Bytes per RGB565 pixel on the wire and in memory.
pub const BYTES_PER_PIXEL: usize = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct Framebuffer {
    data: Vec<u16>,
    width: u32,
    height: u32,
    stride: u32,
}

impl Framebuffer {
    /// Zero-filled buffer with no row padding.
    pub fn new(width: u32, height: u32) -> MirrorResult<Self> {
        Self::with_stride(width, height, width)
    }

    /// Zero-filled buffer whose rows are `stride` pixels apart.
    pub fn with_stride(width: u32, height: u32, stride: u32) -> MirrorResult<Self> {
        let len = pixel_len(width, height, stride)?;
        Ok(Self {
            data: vec![0; len],
            width,
            height,
            stride,
        })
    }

    pub fn from_pixels(width: u32, height: u32, stride: u32, data: Vec<u16>) -> MirrorResult<Self> {
        let expected = pixel_len(width, height, stride)?;
        if data.len() != expected {
            return Err(MirrorError::InvalidConfig(format!(
                "RGB565 frame data length mismatch: got {}, expected {} for {}x{} (stride {})",
                data.len(),
                expected,
                width,
                height,
                stride
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row pitch in pixels.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of visible pixels, excluding row padding.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether rows are packed back to back.
    pub fn is_contiguous(&self) -> bool {
        self.stride == self.width
    }

    pub fn as_pixels(&self) -> &[u16] {
        &self.data
    }

    pub fn as_mut_pixels(&mut self) -> &mut [u16] {
        &mut self.data
    }

    #[inline]
    pub fn index_of(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride as usize + x as usize
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.data[self.index_of(x, y)]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        let idx = self.index_of(x, y);
        self.data[idx] = value;
    }

    /// Visible part of row `y`.
    #[inline]
    pub fn row(&self, y: u32) -> &[u16] {
        let start = self.index_of(0, y);
        &self.data[start..start + self.width as usize]
    }

    #[inline]
    pub fn row_mut(&mut self, y: u32) -> &mut [u16] {
        let start = self.index_of(0, y);
        let width = self.width as usize;
        &mut self.data[start..start + width]
    }

    pub fn fill(&mut self, value: u16) {
        self.data.fill(value);
    }

    pub fn ensure_same_geometry(&self, other: &Framebuffer) -> MirrorResult<()> {
        if self.dimensions() != other.dimensions() || self.stride != other.stride {
            return Err(MirrorError::DimensionMismatch {
                expected: self.dimensions(),
                actual: other.dimensions(),
            });
        }
        Ok(())
    }

    /// Copies every pixel (padding included) from `other`.
    pub fn copy_from(&mut self, other: &Framebuffer) -> MirrorResult<()> {
        self.ensure_same_geometry(other)?;
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Visible pixels as an owned, unpadded vector in raster order.
    pub fn to_packed(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.pixel_count());
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

fn pixel_len(width: u32, height: u32, stride: u32) -> MirrorResult<usize> {
    if width == 0 || height == 0 {
        return Err(MirrorError::InvalidConfig(
            "framebuffer width and height must be > 0".into(),
        ));
    }
    if stride < width {
        return Err(MirrorError::InvalidConfig(format!(
            "row stride {stride} is narrower than width {width}"
        )));
    }
    (stride as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| MirrorError::InvalidConfig("framebuffer size overflow".into()))
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_rows_hide_stride_from_row_accessors() {
        let mut fb = Framebuffer::with_stride(3, 2, 5).unwrap();
        fb.set_pixel(2, 1, 0xBEEF);
        assert_eq!(fb.row(1), &[0, 0, 0xBEEF]);
        assert_eq!(fb.as_pixels().len(), 10);
        assert_eq!(fb.index_of(2, 1), 7);
        assert!(!fb.is_contiguous());
    }

    #[test]
    fn from_pixels_rejects_wrong_length() {
        let err = Framebuffer::from_pixels(4, 4, 4, vec![0; 15]).unwrap_err();
        assert!(matches!(err, MirrorError::InvalidConfig(_)));
    }

    #[test]
    fn copy_from_requires_matching_geometry() {
        let mut a = Framebuffer::new(4, 4).unwrap();
        let b = Framebuffer::new(4, 3).unwrap();
        assert!(matches!(
            a.copy_from(&b),
            Err(MirrorError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn stride_narrower_than_width_is_invalid() {
        assert!(Framebuffer::with_stride(8, 2, 4).is_err());
    }
}
