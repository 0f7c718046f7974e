//! Particle integration on a square compute grid.
//!
//! Particles are laid out row-major on a `pitch x pitch` grid where
//! `pitch = grid_pitch(count)`. The same pitch goes into the uniform buffer
//! and sizes the dispatch, so every particle has exactly one invocation.

use crate::error::{RenderError, Result};
use crate::require;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use prism_core::constants::PARTICLE_WORKGROUP_SIZE;
use prism_core::{dispatch_size, grid_pitch, GpuParticle, Particle};
use prism_gpu::descriptors::{write_storage_buffer, write_uniform_buffer};
use prism_gpu::sync::{submit_and_wait, DEFAULT_FENCE_TIMEOUT_NS};
use prism_gpu::{
    record_dispatch, Capability, ComputePipeline, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DeviceRequirements, GpuBuffer, GpuContext, Workload,
};
use std::sync::Arc;

/// Uniform block of the particle shader (binding 0).
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ParticleParams {
    /// Grid side length
    pub pitch: u32,
    /// Number of live particles
    pub count: u32,
    /// Time step in seconds
    pub dt: f32,
    /// Downward acceleration along -Y
    pub gravity: f32,
}

impl ParticleParams {
    /// Parameters for `count` particles.
    pub const fn new(count: u32, dt: f32, gravity: f32) -> Self {
        Self {
            pitch: grid_pitch(count),
            count,
            dt,
            gravity,
        }
    }

    /// Workgroup counts covering the grid.
    pub const fn groups(&self) -> [u32; 3] {
        dispatch_size(self.pitch, self.pitch, PARTICLE_WORKGROUP_SIZE)
    }

    /// Grid cell of particle `index`.
    pub const fn cell(&self, index: u32) -> [u32; 2] {
        [index % self.pitch, index / self.pitch]
    }
}

/// One explicit Euler step of a single particle, as the shader performs it.
pub fn integrate(particle: &mut GpuParticle, params: &ParticleParams) {
    if particle.position_mass[3] <= 0.0 {
        return;
    }
    particle.velocity[1] -= params.gravity * params.dt;
    for axis in 0..3 {
        particle.position_mass[axis] += particle.velocity[axis] * params.dt;
    }
}

/// Advances a particle set by one time step on the GPU.
pub struct ParticlePass {
    particles: Vec<GpuParticle>,
    params: ParticleParams,
    shader: Vec<u32>,

    params_buffer: Option<GpuBuffer>,
    particle_buffer: Option<GpuBuffer>,
    set_layout: Option<DescriptorSetLayout>,
    pool: Option<Arc<DescriptorPool>>,
    set: Option<DescriptorSet>,
    pipeline: Option<ComputePipeline>,
}

impl ParticlePass {
    /// Create a pass stepping `particles` by `dt` under `gravity`.
    pub fn new(particles: &[Particle], dt: f32, gravity: f32, shader: Vec<u32>) -> Result<Self> {
        if particles.is_empty() {
            return Err(RenderError::InvalidInput("no particles to integrate".to_string()));
        }
        let count = u32::try_from(particles.len())
            .map_err(|_| RenderError::InvalidInput(format!("{} particles", particles.len())))?;
        Ok(Self {
            particles: particles.iter().map(Particle::to_gpu).collect(),
            params: ParticleParams::new(count, dt, gravity),
            shader,
            params_buffer: None,
            particle_buffer: None,
            set_layout: None,
            pool: None,
            set: None,
            pipeline: None,
        })
    }

    /// Parameters written to the uniform buffer.
    pub const fn params(&self) -> &ParticleParams {
        &self.params
    }
}

impl Workload for ParticlePass {
    type Output = Vec<Particle>;
    type Error = RenderError;

    fn name(&self) -> &str {
        "particles"
    }

    fn requirements(&self) -> DeviceRequirements {
        DeviceRequirements::new([Capability::Compute])
    }

    fn create_resources(&mut self, ctx: &GpuContext) -> Result<()> {
        let allocator = ctx.allocator()?;

        let params = allocator.create_host_buffer(
            std::mem::size_of::<ParticleParams>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        params.write(std::slice::from_ref(&self.params))?;
        self.params_buffer = Some(params);

        let particles = allocator.create_host_buffer(
            std::mem::size_of_val(self.particles.as_slice()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        particles.write(&self.particles)?;
        self.particle_buffer = Some(particles);
        Ok(())
    }

    fn build_descriptors(&mut self, ctx: &GpuContext) -> Result<()> {
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())?;
        let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout])?;
        let set = pool.allocate(&layout)?;
        set.write(&[
            write_uniform_buffer(0, require(&self.params_buffer, "params buffer")?),
            write_storage_buffer(1, require(&self.particle_buffer, "particle buffer")?),
        ])?;
        self.set_layout = Some(layout);
        self.pool = Some(pool);
        self.set = Some(set);
        Ok(())
    }

    fn build_pipeline(&mut self, ctx: &GpuContext) -> Result<()> {
        let layout = require(&self.set_layout, "descriptor set layout")?;
        self.pipeline = Some(ComputePipeline::new(ctx.device(), &self.shader, layout, &[])?);
        Ok(())
    }

    fn record_and_submit(&mut self, ctx: &GpuContext) -> Result<()> {
        let pipeline = require(&self.pipeline, "pipeline")?;
        let set = require(&self.set, "descriptor set")?;
        let cmd = record_dispatch(ctx.command_pool(), pipeline, set, self.params.groups(), None)?;
        submit_and_wait(ctx.device(), ctx.primary_queue()?, &cmd, DEFAULT_FENCE_TIMEOUT_NS)?;
        tracing::info!(
            "Integrated {} particles on a {}x{} grid",
            self.params.count,
            self.params.pitch,
            self.params.pitch
        );
        Ok(())
    }

    fn export(&mut self, _ctx: &GpuContext) -> Result<Vec<Particle>> {
        let buffer = require(&self.particle_buffer, "particle buffer")?;
        let particles: Vec<GpuParticle> = buffer.read(self.particles.len())?;
        Ok(particles.iter().map(GpuParticle::to_particle).collect())
    }

    fn release(&mut self) {
        self.pipeline = None;
        self.set = None;
        self.pool = None;
        self.set_layout = None;
        self.particle_buffer = None;
        self.params_buffer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_gpu::mock::{mock_spirv, KernelIo, KernelResult, MockAdapter, MockInstance};
    use prism_gpu::{GpuContextBuilder, Lifecycle};

    const STEP: u32 = 11;

    fn step_kernel(io: &mut KernelIo<'_>) -> KernelResult<()> {
        let params: ParticleParams = bytemuck::pod_read_unaligned(&io.read_buffer(0)?);
        let groups = io.groups();
        let expected = params.groups();
        if groups != expected {
            return Err(format!("dispatched {groups:?}, pitch needs {expected:?}"));
        }
        let bytes = io.read_buffer(1)?;
        let mut particles: Vec<GpuParticle> = bytes
            .chunks_exact(std::mem::size_of::<GpuParticle>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for particle in particles.iter_mut().take(params.count as usize) {
            integrate(particle, &params);
        }
        io.write_buffer(1, bytemuck::cast_slice(&particles))
    }

    #[test]
    fn params_share_the_pitch_with_the_dispatch() {
        let params = ParticleParams::new(1000, 0.1, 9.8);
        assert_eq!(params.pitch, 32);
        assert_eq!(params.groups(), [2, 2, 1]);
        assert_eq!(params.cell(999), [7, 31]);
        assert_eq!(std::mem::size_of::<ParticleParams>(), 16);
    }

    #[test]
    fn integrate_skips_pinned_particles() {
        let params = ParticleParams::new(2, 0.5, 2.0);
        let mut moving = Particle::at_rest([0.0, 10.0, 0.0], 1.0).to_gpu();
        let mut pinned = Particle::at_rest([0.0, 10.0, 0.0], 0.0).to_gpu();
        integrate(&mut moving, &params);
        integrate(&mut pinned, &params);
        assert_relative_eq!(moving.velocity[1], -1.0);
        assert_relative_eq!(moving.position_mass[1], 9.5);
        assert_relative_eq!(pinned.position_mass[1], 10.0);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            ParticlePass::new(&[], 0.1, 9.8, Vec::new()),
            Err(RenderError::InvalidInput(_))
        ));
    }

    #[test]
    fn gpu_step_matches_cpu_step() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        mock.register_kernel(&mock_spirv(STEP), step_kernel);

        let particles: Vec<Particle> = (0..5)
            .map(|i| Particle::at_rest([i as f32, 1.0, 0.0], if i == 2 { 0.0 } else { 1.0 }))
            .collect();
        let pass = ParticlePass::new(&particles, 0.25, 4.0, mock_spirv(STEP)).unwrap();
        let params = *pass.params();
        assert_eq!(params.pitch, 3);

        let mut lifecycle = Lifecycle::new(pass, GpuContextBuilder::new().instance(mock.clone()));
        let output = lifecycle.run().unwrap();
        assert_eq!(output.len(), 5);
        for (before, after) in particles.iter().zip(&output) {
            let mut expected = before.to_gpu();
            integrate(&mut expected, &params);
            assert_eq!(after.to_gpu(), expected);
        }
        assert_relative_eq!(output[2].vertex.position[1], 1.0);
        assert_relative_eq!(output[0].vertex.position[1], 0.75);

        drop(lifecycle);
        assert!(mock.ledger().violations().is_empty());
        assert!(mock.ledger().live_objects().is_empty());
    }
}
