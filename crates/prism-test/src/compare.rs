//! Image comparison and baseline management.

use prism_core::RgbaImage;
use prism_render::{load_rgba, save_rgba};

use crate::{Result, TestError, VisualTestConfig};

/// Compare two images and return the normalized RGB difference (0.0-1.0).
///
/// Alpha is ignored.
#[allow(clippy::cast_precision_loss)]
pub fn compare_images(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if (a.width(), a.height()) != (b.width(), b.height()) {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {}x{} vs {}x{}",
            a.width(),
            a.height(),
            b.width(),
            b.height()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .chunks_exact(4)
        .zip(b.pixels().chunks_exact(4))
        .map(|(pa, pb)| {
            pa[..3]
                .iter()
                .zip(&pb[..3])
                .map(|(&ca, &cb)| u64::from(ca.abs_diff(cb)))
                .sum::<u64>()
        })
        .sum();

    let max_diff = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    Ok(total_diff as f64 / max_diff as f64)
}

/// Create a visual diff image highlighting differences in red.
///
/// Pixels whose largest channel difference is at most 10 show `a` dimmed.
pub fn create_diff_image(a: &RgbaImage, b: &RgbaImage) -> Result<RgbaImage> {
    if (a.width(), a.height()) != (b.width(), b.height()) {
        return Err(TestError::ImageComparison(
            "cannot diff images of different sizes".to_string(),
        ));
    }
    let pixels = a
        .pixels()
        .chunks_exact(4)
        .zip(b.pixels().chunks_exact(4))
        .flat_map(|(pa, pb)| {
            let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
            if max_diff > 10 {
                [255, 0, 0, 255]
            } else {
                [pa[0] / 2, pa[1] / 2, pa[2] / 2, 255]
            }
        })
        .collect();
    RgbaImage::new(a.width(), a.height(), pixels).map_err(|e| TestError::ImageComparison(e.to_string()))
}

/// Visual regression test runner.
///
/// Compares images against PNG baselines and reports differences. A missing
/// baseline is created from the first image checked against it.
#[derive(Debug, Clone, Default)]
pub struct VisualRegressionTest {
    config: VisualTestConfig,
}

impl VisualRegressionTest {
    /// Create a new visual regression test runner.
    pub const fn new(config: VisualTestConfig) -> Self {
        Self { config }
    }

    /// Test configuration.
    pub const fn config(&self) -> &VisualTestConfig {
        &self.config
    }

    /// Save `image` as `<output_dir>/<name>.png` and compare it with the baseline.
    pub fn check(&self, name: &str, image: &RgbaImage) -> Result<()> {
        std::fs::create_dir_all(&self.config.baseline_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let baseline_path = self.config.baseline_dir.join(format!("{name}.png"));
        let output_path = self.config.output_dir.join(format!("{name}.png"));

        save_rgba(image, &output_path)?;

        if !baseline_path.exists() {
            save_rgba(image, &baseline_path)?;
            tracing::info!("Created new baseline: {}", baseline_path.display());
            return Ok(());
        }

        let baseline = load_rgba(&baseline_path)?;
        let diff = compare_images(&baseline, image)?;
        if diff > self.config.threshold {
            let diff_path = self.config.output_dir.join(format!("{name}_diff.png"));
            save_rgba(&create_diff_image(&baseline, image)?, &diff_path)?;

            return Err(TestError::ImageComparison(format!(
                "Image difference {:.4} exceeds threshold {:.4} (see {})",
                diff,
                self.config.threshold,
                diff_path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn scratch_config(test: &str) -> VisualTestConfig {
        let root: PathBuf = std::env::temp_dir().join(format!("prism-test-{test}-{}", std::process::id()));
        VisualTestConfig {
            threshold: 0.01,
            baseline_dir: root.join("baselines"),
            output_dir: root.join("output"),
        }
    }

    #[test]
    fn identical_images_have_no_difference() {
        let image = RgbaImage::filled(4, 4, [12, 34, 56, 255]).unwrap();
        assert_relative_eq!(compare_images(&image, &image).unwrap(), 0.0);
    }

    #[test]
    fn black_and_white_differ_completely() {
        let black = RgbaImage::filled(2, 2, [0, 0, 0, 255]).unwrap();
        let white = RgbaImage::filled(2, 2, [255, 255, 255, 0]).unwrap();
        assert_relative_eq!(compare_images(&black, &white).unwrap(), 1.0);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let a = RgbaImage::filled(2, 2, [0; 4]).unwrap();
        let b = RgbaImage::filled(2, 3, [0; 4]).unwrap();
        assert!(matches!(compare_images(&a, &b), Err(TestError::ImageComparison(_))));
        assert!(create_diff_image(&a, &b).is_err());
    }

    #[test]
    fn diff_image_marks_changed_pixels() {
        let a = RgbaImage::new(2, 1, vec![100, 100, 100, 255, 100, 100, 100, 255]).unwrap();
        let b = RgbaImage::new(2, 1, vec![100, 100, 100, 255, 200, 100, 100, 255]).unwrap();
        let diff = create_diff_image(&a, &b).unwrap();
        assert_eq!(diff.pixel(0, 0), Some([50, 50, 50, 255]));
        assert_eq!(diff.pixel(1, 0), Some([255, 0, 0, 255]));
    }

    #[test]
    fn first_check_creates_the_baseline() {
        let config = scratch_config("baseline");
        let test = VisualRegressionTest::new(config.clone());
        let image = RgbaImage::filled(3, 3, [0, 128, 255, 255]).unwrap();

        test.check("gradient", &image).unwrap();
        assert!(config.baseline_dir.join("gradient.png").exists());
        test.check("gradient", &image).unwrap();

        let changed = RgbaImage::filled(3, 3, [255, 128, 0, 255]).unwrap();
        let err = test.check("gradient", &changed).unwrap_err();
        assert!(matches!(err, TestError::ImageComparison(_)));
        assert!(config.output_dir.join("gradient_diff.png").exists());

        std::fs::remove_dir_all(config.baseline_dir.parent().unwrap()).unwrap();
    }
}
