//! Indexed triangle meshes and simple generated geometry.

use crate::types::Vertex;
use crate::{Error, Result};

/// An indexed triangle list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data
    pub vertices: Vec<Vertex>,
    /// Triangle indices into `vertices`
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Create a mesh, checking that every index refers to a vertex.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self> {
        let mesh = Self { vertices, indices };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Check that the index list forms whole triangles over existing vertices.
    pub fn validate(&self) -> Result<()> {
        if self.indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        let count = self.vertices.len();
        if let Some(bad) = self.indices.iter().find(|&&i| i as usize >= count) {
            return Err(Error::InvalidData(format!(
                "index {bad} out of range for {count} vertices"
            )));
        }
        Ok(())
    }

    /// Number of indices.
    #[inline]
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Vertex data as bytes for upload.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as bytes for upload.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// A square in the XZ plane centered at the origin, facing +Y.
    pub fn plane(size: f32) -> Self {
        let h = size * 0.5;
        let up = [0.0, 1.0, 0.0];
        let vertices = vec![
            Vertex::new([-h, 0.0, -h], up, [0.0, 0.0]),
            Vertex::new([-h, 0.0, h], up, [0.0, 1.0]),
            Vertex::new([h, 0.0, h], up, [1.0, 1.0]),
            Vertex::new([h, 0.0, -h], up, [1.0, 0.0]),
        ];
        Self {
            vertices,
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// An axis-aligned cube centered at `center` with 24 vertices (4 per face).
    pub fn cube(center: [f32; 3], size: f32) -> Self {
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            // normal, u axis, v axis
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let h = size * 0.5;
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in FACES {
            let base = vertices.len() as u32;
            for (su, sv) in CORNERS {
                let position = std::array::from_fn(|i| {
                    center[i] + h * (normal[i] + su * u[i] + sv * v[i])
                });
                let tex_coord = [(su + 1.0) * 0.5, (1.0 - sv) * 0.5];
                vertices.push(Vertex::new(position, normal, tex_coord));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self { vertices, indices }
    }

    /// Append another mesh, offsetting its indices.
    pub fn merge(&mut self, other: &Self) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn plane_is_valid() {
        let plane = Mesh::plane(2.0);
        assert!(plane.validate().is_ok());
        assert_eq!(plane.index_count(), 6);
        assert_relative_eq!(plane.vertices[2].position[0], 1.0);
    }

    #[test]
    fn cube_has_six_faces() {
        let cube = Mesh::cube([0.0, 1.0, 0.0], 1.0);
        assert!(cube.validate().is_ok());
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);
        for v in &cube.vertices {
            assert_relative_eq!(v.position[1], 1.0, epsilon = 0.5 + 1e-6);
            let len: f32 = v.normal.iter().map(|n| n * n).sum();
            assert_relative_eq!(len, 1.0);
        }
    }

    #[test]
    fn merge_offsets_indices() {
        let mut mesh = Mesh::plane(1.0);
        mesh.merge(&Mesh::plane(1.0));
        assert_eq!(mesh.vertices.len(), 8);
        assert_eq!(mesh.indices[6], 4);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let result = Mesh::new(Mesh::plane(1.0).vertices, vec![0, 1, 9]);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn byte_views_match_lengths() {
        let cube = Mesh::cube([0.0; 3], 1.0);
        assert_eq!(cube.vertex_bytes().len(), 24 * 32);
        assert_eq!(cube.index_bytes().len(), 36 * 4);
    }
}
