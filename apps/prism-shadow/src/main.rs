//! Prism Shadow Demo
//!
//! Renders a cube standing on a ground plane into a depth-only shadow map
//! through a tessellation pipeline and writes a gray visualization of the
//! depth to `shadow_depth.png`.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-shadow
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `PRISM_SHADER_DIR`: Load SPIR-V from this directory instead of the build output

use std::process::ExitCode;

use anyhow::Context as _;
use prism_app::{run_app, run_workload, AppConfig};
use prism_core::Mesh;
use prism_render::{save_rgba, Light, ShadowPass, ShadowShaders};
use tracing::info;

const OUTPUT_FILE: &str = "shadow_depth.png";
const SHADOW_MAP_SIZE: u32 = 1024;

fn main() -> ExitCode {
    run_app(&AppConfig::new("Prism Shadow Demo"), run)
}

fn run(config: &AppConfig) -> anyhow::Result<()> {
    let shaders = ShadowShaders::load(&config.shader_library())?;
    let mesh = scene();
    info!(
        "Scene: {} vertices, {} triangles",
        mesh.vertices.len(),
        mesh.index_count() / 3
    );

    let pass = ShadowPass::new(mesh, Light::default(), SHADOW_MAP_SIZE, shaders)?;
    let shadow_map = run_workload(config, pass)?;

    let output_path = config.output_path(OUTPUT_FILE);
    save_rgba(&shadow_map.to_image()?, &output_path)
        .with_context(|| format!("writing {}", output_path.display()))?;
    Ok(())
}

/// A ground plane with a unit cube resting on it.
fn scene() -> Mesh {
    let mut mesh = Mesh::plane(10.0);
    mesh.merge(&Mesh::cube([0.0, 0.5, 0.0], 1.0));
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_is_valid() {
        let mesh = scene();
        mesh.validate().unwrap();
        assert_eq!(mesh.index_count() % 3, 0);
        assert!(mesh.index_count() > 6);
    }
}
