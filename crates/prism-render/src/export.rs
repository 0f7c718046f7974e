//! PNG import and export.

use crate::error::{RenderError, Result};
use prism_core::RgbaImage;
use std::path::Path;
use tracing::info;

/// Decode an image file into tightly packed RGBA8.
pub fn load_rgba(path: impl AsRef<Path>) -> Result<RgbaImage> {
    let path = path.as_ref();
    let decoded = image::open(path)?.into_rgba8();
    let (width, height) = decoded.dimensions();
    info!("Loaded {} ({}x{})", path.display(), width, height);
    Ok(RgbaImage::new(width, height, decoded.into_raw())?)
}

/// Save an RGBA8 image; the format follows the file extension.
pub fn save_rgba(image: &RgbaImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let buffer = image::RgbaImage::from_raw(image.width(), image.height(), image.pixels().to_vec())
        .ok_or_else(|| RenderError::InvalidInput("pixel count does not match extent".to_string()))?;
    buffer.save(path)?;
    info!("Image saved: {}", path.display());
    Ok(())
}

/// Reinterpret little-endian bytes read back from a `D32_SFLOAT` image.
pub fn depth_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RenderError::InvalidInput(format!(
            "depth readback of {} bytes is not a whole number of texels",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Gray RGBA8 visualization of a depth buffer.
///
/// Depth is normalized so the nearest texel maps to 0 and the farthest to
/// 255. A buffer with a single depth value maps that value from `0.0..=1.0`
/// directly.
pub fn visualize_depth(depth: &[f32], width: u32, height: u32) -> Result<RgbaImage> {
    if depth.len() != width as usize * height as usize {
        return Err(RenderError::InvalidInput(format!(
            "{} depth texels for a {width}x{height} image",
            depth.len()
        )));
    }
    let (min, max) = depth
        .iter()
        .filter(|d| d.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| {
            (lo.min(d), hi.max(d))
        });
    let range = max - min;

    let pixels = depth
        .iter()
        .flat_map(|&d| {
            let t = if range > f32::EPSILON {
                (d - min) / range
            } else {
                d
            };
            let gray = (t.clamp(0.0, 1.0) * 255.0).round() as u8;
            [gray, gray, gray, 255]
        })
        .collect();
    Ok(RgbaImage::new(width, height, pixels)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_bytes_decode_little_endian() {
        let bytes: Vec<u8> = [0.25f32, 1.0].iter().flat_map(|d| d.to_le_bytes()).collect();
        assert_eq!(depth_from_bytes(&bytes).unwrap(), vec![0.25, 1.0]);
        assert!(depth_from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn depth_is_normalized_to_full_range() {
        let image = visualize_depth(&[0.5, 0.75, 1.0, 0.5], 2, 2).unwrap();
        assert_eq!(image.pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(image.pixel(1, 0), Some([128, 128, 128, 255]));
        assert_eq!(image.pixel(0, 1), Some([255, 255, 255, 255]));
    }

    #[test]
    fn flat_depth_maps_directly() {
        let image = visualize_depth(&[1.0; 4], 2, 2).unwrap();
        assert!(image.pixels().iter().all(|&b| b == 255));
        let image = visualize_depth(&[0.0; 4], 2, 2).unwrap();
        assert_eq!(image.pixel(1, 1), Some([0, 0, 0, 255]));
    }

    #[test]
    fn depth_extent_must_match() {
        assert!(matches!(
            visualize_depth(&[1.0; 3], 2, 2),
            Err(RenderError::InvalidInput(_))
        ));
    }

    #[test]
    fn png_round_trip() {
        let path = std::env::temp_dir().join(format!("prism-export-{}.png", std::process::id()));
        let image = RgbaImage::filled(3, 2, [10, 20, 30, 255]).unwrap();
        save_rgba(&image, &path).unwrap();
        let loaded = load_rgba(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, image);
    }
}
