//! GPU workloads of the Prism demos.
//!
//! This crate provides:
//! - An image compute pass (sampled input to storage output)
//! - A particle integration pass on a square dispatch grid
//! - A tessellated depth-only shadow map pass
//! - PNG import/export and depth visualization

pub mod error;
pub mod export;
pub mod image_pass;
pub mod particles;
pub mod shadow_pass;
pub mod vertex_input;

pub use error::{RenderError, Result};
pub use export::{load_rgba, save_rgba, visualize_depth};
pub use image_pass::ImagePass;
pub use particles::{integrate, ParticleParams, ParticlePass};
pub use shadow_pass::{Light, LightUniforms, ShadowMap, ShadowPass, ShadowShaders};

/// Borrow an object created by an earlier workload phase.
pub(crate) fn require<'a, T>(slot: &'a Option<T>, what: &'static str) -> Result<&'a T> {
    slot.as_ref().ok_or(RenderError::Missing(what))
}
