//! Application framework for the Prism demos.
//!
//! This crate handles the boilerplate shared by the demo binaries:
//! - Logging setup from `RUST_LOG`
//! - Configuration (validation, output and shader directories)
//! - Running a [`Workload`](prism_gpu::Workload) with guaranteed teardown
//! - Mapping the outcome to a process exit status
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{run_app, run_workload, AppConfig};
//! use prism_core::RgbaImage;
//! use prism_render::ImagePass;
//! use prism_shaders::names;
//!
//! fn main() -> std::process::ExitCode {
//!     run_app(&AppConfig::new("demo"), |config| {
//!         let shader = config.shader_library().load(names::IMAGE_COMP)?;
//!         let input = RgbaImage::filled(4, 4, [255; 4])?;
//!         let output = run_workload(config, ImagePass::new(input, shader))?;
//!         prism_render::save_rgba(&output, config.output_path("output.png"))?;
//!         Ok(())
//!     })
//! }
//! ```

mod runner;

pub use runner::{init_logging, run_app, run_workload, AppConfig};

// Re-export commonly used types for convenience
pub use prism_gpu::{GpuContext, GpuContextBuilder};
