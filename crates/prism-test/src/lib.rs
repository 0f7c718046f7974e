//! Test harness for the Prism demos.
//!
//! Provides mock GPU presets, workload runs with teardown reports, and image
//! comparison against baselines.

pub mod compare;
pub mod harness;
pub mod kernels;

pub use compare::{compare_images, create_diff_image, VisualRegressionTest};
pub use harness::{format_teardown, MockHarness, RunReport};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(String),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Render error: {0}")]
    Render(#[from] prism_render::RenderError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Visual regression test configuration.
#[derive(Debug, Clone)]
pub struct VisualTestConfig {
    /// Maximum allowed pixel difference (0.0-1.0).
    pub threshold: f64,
    /// Directory for baseline images.
    pub baseline_dir: PathBuf,
    /// Directory for test output images.
    pub output_dir: PathBuf,
}

impl Default for VisualTestConfig {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            baseline_dir: PathBuf::from("assets/test_data/baselines"),
            output_dir: PathBuf::from("target/test_output"),
        }
    }
}
