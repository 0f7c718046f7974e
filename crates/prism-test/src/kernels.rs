//! CPU kernels standing in for the demo shaders on the mock GPU.

use prism_core::GpuParticle;
use prism_gpu::mock::{mock_spirv, KernelIo, KernelResult, MockInstance};
use prism_render::{integrate, ParticleParams};

/// Tag of the image copy kernel.
pub const COPY_TAG: u32 = 0x434f_5059;
/// Tag of the particle step kernel.
pub const PARTICLES_TAG: u32 = 0x5041_5254;

/// Shader words of the image copy kernel.
pub fn copy_shader() -> Vec<u32> {
    mock_spirv(COPY_TAG)
}

/// Shader words of the particle step kernel.
pub fn particle_shader() -> Vec<u32> {
    mock_spirv(PARTICLES_TAG)
}

/// Copies the sampled image in binding 0 into the storage image in binding 1.
pub fn copy_image(io: &mut KernelIo<'_>) -> KernelResult<()> {
    let input = io.read_image(0)?;
    let output = io.image_extent(1)?;
    let expected = io.image_extent(0)?;
    if output != expected {
        return Err(format!("output {output:?} does not match input {expected:?}"));
    }
    io.write_image(1, &input)
}

/// One integration step over the storage buffer in binding 1.
///
/// Fails if the dispatch does not cover exactly the grid in the uniform
/// buffer at binding 0.
pub fn step_particles(io: &mut KernelIo<'_>) -> KernelResult<()> {
    let params: ParticleParams = bytemuck::pod_read_unaligned(&io.read_buffer(0)?);
    let groups = io.groups();
    if groups != params.groups() {
        return Err(format!(
            "dispatched {groups:?} for a {}x{} grid",
            params.pitch, params.pitch
        ));
    }
    let mut particles: Vec<GpuParticle> = io
        .read_buffer(1)?
        .chunks_exact(std::mem::size_of::<GpuParticle>())
        .map(bytemuck::pod_read_unaligned)
        .collect();
    for particle in particles.iter_mut().take(params.count as usize) {
        integrate(particle, &params);
    }
    io.write_buffer(1, bytemuck::cast_slice(&particles))
}

/// Register every demo kernel on `mock`.
pub fn register_all(mock: &MockInstance) {
    mock.register_kernel(&copy_shader(), copy_image);
    mock.register_kernel(&particle_shader(), step_particles);
}
