//! Decoded RGBA8 images.

use crate::constants::RGBA8_BYTES_PER_PIXEL;
use crate::{Error, Result};

/// A tightly packed RGBA8 image (row stride = `width * 4`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbaImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RgbaImage {
    /// Wrap decoded pixels, checking that the byte count matches the extent.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidData(format!(
                "image extent must be non-zero, got {width}x{height}"
            )));
        }
        let expected = Self::byte_len(width, height);
        if pixels.len() != expected {
            return Err(Error::InvalidData(format!(
                "{width}x{height} RGBA8 image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Create an image filled with a single color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(Self::byte_len(width, height))
            .collect();
        Self::new(width, height, pixels)
    }

    /// Number of bytes a `width` x `height` image occupies.
    #[inline]
    pub const fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * RGBA8_BYTES_PER_PIXEL
    }

    /// Image width in pixels.
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Raw pixel bytes.
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Consume the image and return its pixel bytes.
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Pixel at (x, y), or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * RGBA8_BYTES_PER_PIXEL;
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.pixels[offset..offset + RGBA8_BYTES_PER_PIXEL]);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_image_has_expected_pixels() {
        let image = RgbaImage::filled(4, 4, [255, 255, 255, 255]).unwrap();
        assert_eq!(image.pixels().len(), 64);
        assert!(image.pixels().iter().all(|&b| b == 255));
        assert_eq!(image.pixel(3, 3), Some([255; 4]));
        assert_eq!(image.pixel(4, 0), None);
    }

    #[test]
    fn rejects_wrong_byte_count() {
        assert!(matches!(
            RgbaImage::new(2, 2, vec![0; 15]),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn rejects_empty_extent() {
        assert!(RgbaImage::new(0, 4, Vec::new()).is_err());
    }

    #[test]
    fn pixel_addressing_is_row_major() {
        let mut pixels = vec![0u8; RgbaImage::byte_len(2, 2)];
        pixels[8..12].copy_from_slice(&[1, 2, 3, 4]);
        let image = RgbaImage::new(2, 2, pixels).unwrap();
        assert_eq!(image.pixel(0, 1), Some([1, 2, 3, 4]));
    }
}
