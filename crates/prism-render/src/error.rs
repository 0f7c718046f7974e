//! Render error types.

use prism_gpu::GpuError;
use prism_shaders::ShaderError;
use thiserror::Error;

/// Errors raised by the render passes and exporters.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU layer failure
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Shader could not be loaded
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// Invalid CPU-side data
    #[error(transparent)]
    Core(#[from] prism_core::Error),

    /// PNG decode or encode failure
    #[error("Image I/O failed: {0}")]
    Image(#[from] image::ImageError),

    /// Input the pass cannot process
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A phase ran before the one that creates what it needs
    #[error("{0} has not been created")]
    Missing(&'static str),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
