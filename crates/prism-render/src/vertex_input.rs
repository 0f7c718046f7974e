//! Vertex input descriptions for [`Vertex`].

use ash::vk;
use prism_core::Vertex;

/// Binding 0, per-vertex, stride of one [`Vertex`].
pub fn vertex_bindings() -> Vec<vk::VertexInputBindingDescription> {
    vec![vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    }]
}

/// Position, normal and texture coordinate at locations 0, 1 and 2.
pub fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
    vec![
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::POSITION_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::NORMAL_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::TEX_COORD_OFFSET,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_fit_in_stride() {
        let stride = vertex_bindings()[0].stride;
        for attribute in vertex_attributes() {
            let size = match attribute.format {
                vk::Format::R32G32B32_SFLOAT => 12,
                vk::Format::R32G32_SFLOAT => 8,
                other => panic!("unexpected format {other:?}"),
            };
            assert!(attribute.offset + size <= stride);
        }
    }
}
