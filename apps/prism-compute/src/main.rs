//! Prism Compute Demo
//!
//! Runs an image compute pass over an RGBA8 image and writes `output.png`,
//! then advances a grid of particles by one time step.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-compute
//! ```
//!
//! If `input.png` exists in the working directory it is used as the input
//! image; otherwise a generated gradient is used.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `PRISM_SHADER_DIR`: Load SPIR-V from this directory instead of the build output

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context as _;
use prism_app::{run_app, run_workload, AppConfig};
use prism_core::{Particle, RgbaImage};
use prism_render::{load_rgba, save_rgba, ImagePass, ParticlePass};
use prism_shaders::names;
use tracing::info;

const INPUT_FILE: &str = "input.png";
const OUTPUT_FILE: &str = "output.png";

const GRADIENT_SIZE: u32 = 256;
const PARTICLE_SIDE: u32 = 30;
const TIME_STEP: f32 = 1.0 / 60.0;
const GRAVITY: f32 = 9.81;

fn main() -> ExitCode {
    run_app(&AppConfig::new("Prism Compute Demo"), run)
}

fn run(config: &AppConfig) -> anyhow::Result<()> {
    let shaders = config.shader_library();

    let input = load_input(Path::new(INPUT_FILE))?;
    let shader = shaders.load(names::IMAGE_COMP)?;
    let output = run_workload(config, ImagePass::new(input, shader))?;
    let output_path = config.output_path(OUTPUT_FILE);
    save_rgba(&output, &output_path)
        .with_context(|| format!("writing {}", output_path.display()))?;

    let particles = particle_grid(PARTICLE_SIDE);
    let shader = shaders.load(names::PARTICLES_COMP)?;
    let pass = ParticlePass::new(&particles, TIME_STEP, GRAVITY, shader)?;
    let pitch = pass.params().pitch;
    let stepped = run_workload(config, pass)?;

    let fallen = particles
        .iter()
        .zip(&stepped)
        .filter(|(before, after)| after.vertex.position[1] < before.vertex.position[1])
        .count();
    info!(
        "Stepped {} particles on a {}x{} grid, {} moved down",
        stepped.len(),
        pitch,
        pitch,
        fallen
    );
    Ok(())
}

fn load_input(path: &Path) -> anyhow::Result<RgbaImage> {
    if path.exists() {
        return Ok(load_rgba(path)?);
    }
    info!("{} not found, using a generated gradient", path.display());
    gradient(GRADIENT_SIZE, GRADIENT_SIZE)
}

fn gradient(width: u32, height: u32) -> anyhow::Result<RgbaImage> {
    let pixels = (0..height)
        .flat_map(|y| {
            (0..width).flat_map(move |x| {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                [r, g, 128, 255]
            })
        })
        .collect();
    Ok(RgbaImage::new(width, height, pixels)?)
}

/// `side * side` particles on the unit square at height 1, the corners pinned.
fn particle_grid(side: u32) -> Vec<Particle> {
    let last = side.saturating_sub(1).max(1) as f32;
    (0..side * side)
        .map(|i| {
            let (x, z) = (i % side, i / side);
            let corner = (x == 0 || x == side - 1) && (z == 0 || z == side - 1);
            Particle::at_rest(
                [x as f32 / last, 1.0, z as f32 / last],
                if corner { 0.0 } else { 1.0 },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_spans_the_image() {
        let image = gradient(4, 2).unwrap();
        assert_eq!(image.pixel(0, 0), Some([0, 0, 128, 255]));
        assert_eq!(image.pixel(3, 1), Some([191, 127, 128, 255]));
    }

    #[test]
    fn grid_pins_the_corners() {
        let grid = particle_grid(3);
        assert_eq!(grid.len(), 9);
        let pinned: Vec<usize> = grid
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_pinned())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pinned, vec![0, 2, 6, 8]);
        assert_eq!(grid[8].vertex.position, [1.0, 1.0, 1.0]);
    }
}
