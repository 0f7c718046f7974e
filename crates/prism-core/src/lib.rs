//! Core data types for the Prism GPU demos.
//!
//! This crate holds the CPU-side data that flows into and out of the GPU:
//! - Vertex and particle layouts
//! - Decoded RGBA8 images
//! - Meshes and generated geometry
//! - Dispatch sizing math

pub mod error;
pub mod image;
pub mod math;
pub mod mesh;
pub mod types;

pub use error::{Error, Result};
pub use image::RgbaImage;
pub use math::{dispatch_size, grid_pitch, workgroup_count};
pub use mesh::Mesh;
pub use types::{GpuParticle, Particle, Vertex};

/// Shared constants.
pub mod constants {
    /// Bytes per RGBA8 pixel.
    pub const RGBA8_BYTES_PER_PIXEL: usize = 4;
    /// Local workgroup size of the 2D compute shaders (per axis).
    pub const IMAGE_WORKGROUP_SIZE: u32 = 16;
    /// Local workgroup size of the particle shader (per axis, 2D grid).
    pub const PARTICLE_WORKGROUP_SIZE: u32 = 16;
}
