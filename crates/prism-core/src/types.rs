//! Vertex and particle layouts.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// A mesh vertex as consumed by the vertex input stage.
///
/// The layout is tightly packed (32 bytes) and matches the vertex input
/// description used by the graphics pipeline: position at offset 0, normal at
/// offset 12, texture coordinate at offset 24.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Unit normal
    pub normal: [f32; 3],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Byte offset of [`Vertex::position`].
    pub const POSITION_OFFSET: u32 = 0;
    /// Byte offset of [`Vertex::normal`].
    pub const NORMAL_OFFSET: u32 = 12;
    /// Byte offset of [`Vertex::tex_coord`].
    pub const TEX_COORD_OFFSET: u32 = 24;
    /// Size of one vertex in bytes.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Create a new vertex.
    #[inline]
    pub const fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coord,
        }
    }

    /// Position as a vector.
    #[inline]
    pub fn position_vec(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// A vertex with an application-defined mass.
///
/// The mass lives outside the core vertex format. The particle pass treats the
/// normal as the particle velocity; a non-positive mass pins the particle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    /// Position, velocity and texture coordinate
    pub vertex: Vertex,
    /// Particle mass
    pub mass: f32,
}

impl Particle {
    /// Create a particle at rest.
    pub const fn at_rest(position: [f32; 3], mass: f32) -> Self {
        Self {
            vertex: Vertex::new(position, [0.0; 3], [0.0; 2]),
            mass,
        }
    }

    /// Returns true if the particle does not move.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.mass <= 0.0
    }

    /// Convert to the storage-buffer layout.
    pub const fn to_gpu(&self) -> GpuParticle {
        let [px, py, pz] = self.vertex.position;
        let [vx, vy, vz] = self.vertex.normal;
        GpuParticle {
            position_mass: [px, py, pz, self.mass],
            velocity: [vx, vy, vz, 0.0],
            tex_coord: self.vertex.tex_coord,
            _padding: [0.0; 2],
        }
    }
}

/// Storage-buffer layout of a particle (std430, 48 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GpuParticle {
    /// xyz = position, w = mass
    pub position_mass: [f32; 4],
    /// xyz = velocity, w unused
    pub velocity: [f32; 4],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
    _padding: [f32; 2],
}

impl GpuParticle {
    /// Convert back to the CPU representation.
    pub const fn to_particle(&self) -> Particle {
        let [px, py, pz, mass] = self.position_mass;
        let [vx, vy, vz, _] = self.velocity;
        Particle {
            vertex: Vertex::new([px, py, pz], [vx, vy, vz], self.tex_coord),
            mass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(Vertex::STRIDE, 32);
        assert_eq!(
            std::mem::offset_of!(Vertex, normal) as u32,
            Vertex::NORMAL_OFFSET
        );
        assert_eq!(
            std::mem::offset_of!(Vertex, tex_coord) as u32,
            Vertex::TEX_COORD_OFFSET
        );
    }

    #[test]
    fn gpu_particle_layout() {
        assert_eq!(std::mem::size_of::<GpuParticle>(), 48);
        assert_eq!(std::mem::align_of::<GpuParticle>(), 4);
    }

    #[test]
    fn particle_gpu_conversion_keeps_mass() {
        let mut particle = Particle::at_rest([1.0, 2.0, 3.0], 0.5);
        particle.vertex.normal = [0.0, -1.0, 0.0];
        let back = particle.to_gpu().to_particle();
        assert_eq!(back, particle);
        assert!(!back.is_pinned());
        assert!(Particle::at_rest([0.0; 3], 0.0).is_pinned());
    }
}
