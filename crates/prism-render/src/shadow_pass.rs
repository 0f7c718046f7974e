//! Depth-only shadow map pass with a tessellated geometry stage.
//!
//! The mesh is drawn from the light's point of view through
//! vertex, tessellation control, tessellation evaluation and fragment
//! stages into a `D32_SFLOAT` attachment. The render pass leaves the
//! attachment in `TRANSFER_SRC_OPTIMAL` so it can be read back directly.

use crate::error::{RenderError, Result};
use crate::export::{depth_from_bytes, visualize_depth};
use crate::require;
use crate::vertex_input::{vertex_attributes, vertex_bindings};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use prism_core::{Mesh, RgbaImage};
use prism_gpu::descriptors::write_uniform_buffer;
use prism_gpu::sync::{submit_and_wait, DEFAULT_FENCE_TIMEOUT_NS};
use prism_gpu::{
    record_draw, Capability, ClearValue, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DeviceFeature, DeviceRequirements, DrawCall, Framebuffer, GpuBuffer,
    GpuContext, GpuImage, GraphicsPipeline, GraphicsPipelineConfig, ImageDesc, ImageView,
    RenderPass, Workload,
};
use prism_shaders::{names, ShaderLibrary};
use std::sync::Arc;

/// Depth attachment format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Orthographic light looking at the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    /// Light position
    pub position: Vec3,
    /// Point the light looks at
    pub target: Vec3,
    /// Half extent of the orthographic volume
    pub radius: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            position: Vec3::new(4.0, 8.0, 4.0),
            target: Vec3::ZERO,
            radius: 4.0,
            near: 0.1,
            far: 20.0,
        }
    }
}

impl Light {
    /// World to clip space with a `0..1` depth range.
    pub fn view_projection(&self) -> Mat4 {
        let forward = (self.target - self.position).normalize_or_zero();
        let up = if forward.cross(Vec3::Y).length_squared() < 1e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_at_rh(self.position, self.target, up);
        let projection = Mat4::orthographic_rh(
            -self.radius,
            self.radius,
            -self.radius,
            self.radius,
            self.near,
            self.far,
        );
        projection * view
    }
}

/// Uniform block of the tessellation evaluation stage (binding 0).
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct LightUniforms {
    /// Column-major light view-projection matrix
    pub view_projection: [[f32; 4]; 4],
}

impl From<&Light> for LightUniforms {
    fn from(light: &Light) -> Self {
        Self {
            view_projection: light.view_projection().to_cols_array_2d(),
        }
    }
}

/// SPIR-V of the four shadow stages.
#[derive(Debug, Clone, Default)]
pub struct ShadowShaders {
    /// Vertex stage
    pub vertex: Vec<u32>,
    /// Tessellation control stage
    pub control: Vec<u32>,
    /// Tessellation evaluation stage
    pub evaluation: Vec<u32>,
    /// Fragment stage
    pub fragment: Vec<u32>,
}

impl ShadowShaders {
    /// Load the compiled shadow shaders from `library`.
    pub fn load(library: &ShaderLibrary) -> Result<Self> {
        Ok(Self {
            vertex: library.load(names::SHADOW_VERT)?,
            control: library.load(names::SHADOW_TESC)?,
            evaluation: library.load(names::SHADOW_TESE)?,
            fragment: library.load(names::SHADOW_FRAG)?,
        })
    }
}

/// Depth values read back from the shadow map.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowMap {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Row-major depth values
    pub depth: Vec<f32>,
}

impl ShadowMap {
    /// Gray visualization of the depth values.
    pub fn to_image(&self) -> Result<RgbaImage> {
        visualize_depth(&self.depth, self.width, self.height)
    }
}

/// Renders a mesh into a shadow map.
pub struct ShadowPass {
    mesh: Mesh,
    light: Light,
    extent: vk::Extent2D,
    shaders: ShadowShaders,

    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    light_buffer: Option<GpuBuffer>,
    depth_image: Option<Arc<GpuImage>>,
    depth_view: Option<ImageView>,

    set_layout: Option<DescriptorSetLayout>,
    pool: Option<Arc<DescriptorPool>>,
    set: Option<DescriptorSet>,
    render_pass: Option<RenderPass>,
    framebuffer: Option<Framebuffer>,
    pipeline: Option<GraphicsPipeline>,
}

impl ShadowPass {
    /// Create a pass rendering `mesh` into a `size x size` shadow map.
    pub fn new(mesh: Mesh, light: Light, size: u32, shaders: ShadowShaders) -> Result<Self> {
        mesh.validate()?;
        if mesh.indices.is_empty() {
            return Err(RenderError::InvalidInput("mesh has no triangles".to_string()));
        }
        if size == 0 {
            return Err(RenderError::InvalidInput("shadow map size must be non-zero".to_string()));
        }
        Ok(Self {
            mesh,
            light,
            extent: vk::Extent2D {
                width: size,
                height: size,
            },
            shaders,
            vertex_buffer: None,
            index_buffer: None,
            light_buffer: None,
            depth_image: None,
            depth_view: None,
            set_layout: None,
            pool: None,
            set: None,
            render_pass: None,
            framebuffer: None,
            pipeline: None,
        })
    }

    fn pipeline_config(&self) -> GraphicsPipelineConfig {
        GraphicsPipelineConfig {
            vertex_shader: self.shaders.vertex.clone(),
            tessellation_control_shader: Some(self.shaders.control.clone()),
            tessellation_evaluation_shader: Some(self.shaders.evaluation.clone()),
            fragment_shader: Some(self.shaders.fragment.clone()),
            vertex_bindings: vertex_bindings(),
            vertex_attributes: vertex_attributes(),
            patch_control_points: 3,
            extent: self.extent,
            cull_mode: vk::CullModeFlags::NONE,
            ..GraphicsPipelineConfig::default()
        }
    }
}

impl Workload for ShadowPass {
    type Output = ShadowMap;
    type Error = RenderError;

    fn name(&self) -> &str {
        "shadow"
    }

    fn requirements(&self) -> DeviceRequirements {
        DeviceRequirements::new([Capability::Graphics]).feature(DeviceFeature::TessellationShader)
    }

    fn create_resources(&mut self, ctx: &GpuContext) -> Result<()> {
        let allocator = ctx.allocator()?;

        self.vertex_buffer = Some(
            allocator.upload_buffer(self.mesh.vertex_bytes(), vk::BufferUsageFlags::VERTEX_BUFFER)?,
        );
        self.index_buffer = Some(
            allocator.upload_buffer(self.mesh.index_bytes(), vk::BufferUsageFlags::INDEX_BUFFER)?,
        );

        let light = allocator.create_host_buffer(
            std::mem::size_of::<LightUniforms>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        light.write(&[LightUniforms::from(&self.light)])?;
        self.light_buffer = Some(light);

        let depth = allocator.create_image(
            ImageDesc {
                extent: self.extent,
                format: DEPTH_FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.depth_view = Some(allocator.create_image_view(&depth, vk::ImageAspectFlags::DEPTH)?);
        self.depth_image = Some(depth);
        Ok(())
    }

    fn build_descriptors(&mut self, ctx: &GpuContext) -> Result<()> {
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(
                0,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            )
            .build(ctx.device())?;
        let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout])?;
        let set = pool.allocate(&layout)?;
        set.write(&[write_uniform_buffer(0, require(&self.light_buffer, "light buffer")?)])?;
        self.set_layout = Some(layout);
        self.pool = Some(pool);
        self.set = Some(set);
        Ok(())
    }

    fn build_pipeline(&mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        let render_pass =
            RenderPass::depth_only(device, DEPTH_FORMAT, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        let depth_view = require(&self.depth_view, "depth view")?;
        let framebuffer = Framebuffer::new(device, &render_pass, &[depth_view], self.extent)?;
        let layout = require(&self.set_layout, "descriptor set layout")?;
        let pipeline = GraphicsPipeline::new(device, &self.pipeline_config(), layout, &[], &render_pass)?;
        self.render_pass = Some(render_pass);
        self.framebuffer = Some(framebuffer);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn record_and_submit(&mut self, ctx: &GpuContext) -> Result<()> {
        let draw = DrawCall {
            render_pass: require(&self.render_pass, "render pass")?,
            framebuffer: require(&self.framebuffer, "framebuffer")?,
            pipeline: require(&self.pipeline, "pipeline")?,
            descriptor_set: Some(require(&self.set, "descriptor set")?),
            push_constants: None,
            vertex_buffer: require(&self.vertex_buffer, "vertex buffer")?,
            index_buffer: require(&self.index_buffer, "index buffer")?,
            index_count: self.mesh.index_count(),
            clear_values: vec![ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }],
        };
        let cmd = record_draw(ctx.command_pool(), &draw)?;
        submit_and_wait(ctx.device(), ctx.queue(Capability::Graphics)?, &cmd, DEFAULT_FENCE_TIMEOUT_NS)?;
        tracing::info!(
            "Rendered {} triangles into a {}x{} shadow map",
            self.mesh.index_count() / 3,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    fn export(&mut self, ctx: &GpuContext) -> Result<ShadowMap> {
        let depth = require(&self.depth_image, "depth image")?;
        let bytes = ctx
            .allocator()?
            .download_image(depth, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        Ok(ShadowMap {
            width: self.extent.width,
            height: self.extent.height,
            depth: depth_from_bytes(&bytes)?,
        })
    }

    fn release(&mut self) {
        self.pipeline = None;
        self.framebuffer = None;
        self.render_pass = None;
        self.set = None;
        self.pool = None;
        self.set_layout = None;
        self.depth_view = None;
        self.depth_image = None;
        self.light_buffer = None;
        self.index_buffer = None;
        self.vertex_buffer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_gpu::mock::{mock_spirv, MockAdapter, MockInstance};
    use prism_gpu::{GpuContextBuilder, GpuError, Lifecycle};

    fn shaders() -> ShadowShaders {
        ShadowShaders {
            vertex: mock_spirv(1),
            control: mock_spirv(2),
            evaluation: mock_spirv(3),
            fragment: mock_spirv(4),
        }
    }

    #[test]
    fn light_maps_target_inside_depth_range() {
        let light = Light::default();
        let clip = light.view_projection() * light.target.extend(1.0);
        assert_relative_eq!(clip.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y, 0.0, epsilon = 1e-5);
        assert!(clip.z > 0.0 && clip.z < 1.0);
    }

    #[test]
    fn vertical_light_has_valid_basis() {
        let light = Light {
            position: Vec3::new(0.0, 10.0, 0.0),
            ..Light::default()
        };
        assert!(light.view_projection().is_finite());
    }

    #[test]
    fn renders_cleared_depth_with_tessellation() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let pass = ShadowPass::new(Mesh::cube([0.0; 3], 1.0), Light::default(), 8, shaders()).unwrap();
        let mut lifecycle = Lifecycle::new(pass, GpuContextBuilder::new().instance(mock.clone()));
        let map = lifecycle.run().unwrap();

        assert_eq!(map.depth.len(), 64);
        assert!(map.depth.iter().all(|&d| (d - 1.0).abs() < f32::EPSILON));
        assert!(map.to_image().unwrap().pixels().iter().all(|&b| b == 255));

        let pipeline = mock.last_graphics_pipeline().unwrap();
        assert_eq!(pipeline.topology, vk::PrimitiveTopology::PATCH_LIST);
        assert_eq!(pipeline.patch_control_points, Some(3));
        assert_eq!(pipeline.stages.len(), 4);
        assert_eq!(pipeline.extent, vk::Extent2D { width: 8, height: 8 });
        assert_eq!(mock.stats().draws, 1);

        drop(lifecycle);
        assert!(mock.ledger().violations().is_empty(), "{:?}", mock.ledger().violations());
        assert!(mock.ledger().live_objects().is_empty());
    }

    #[test]
    fn requires_tessellation() {
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let mock = MockInstance::new(vec![MockAdapter::new("No tess").features(features)]);
        let pass = ShadowPass::new(Mesh::plane(1.0), Light::default(), 4, shaders()).unwrap();
        let mut lifecycle = Lifecycle::new(pass, GpuContextBuilder::new().instance(mock));
        assert!(matches!(
            lifecycle.run(),
            Err(RenderError::Gpu(GpuError::NoSuitableDevice))
        ));
    }

    #[test]
    fn rejects_empty_mesh() {
        assert!(ShadowPass::new(Mesh::default(), Light::default(), 4, shaders()).is_err());
    }
}
