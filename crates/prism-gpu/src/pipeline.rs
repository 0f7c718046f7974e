//! Pipeline creation and management.

#![warn(missing_docs)]

use crate::api::{AttachmentDesc, FramebufferDesc, GraphicsPipelineDesc, RenderPassDesc};
use crate::context::Device;
use crate::descriptors::DescriptorSetLayout;
use crate::error::{GpuError, Result};
use crate::memory::ImageView;
use ash::vk;
use std::sync::Arc;

/// Shader module that lives only for the duration of a pipeline build.
struct ShaderModule<'a> {
    module: vk::ShaderModule,
    device: &'a Device,
}

impl<'a> ShaderModule<'a> {
    fn new(device: &'a Device, code: &[u32]) -> Result<Self> {
        let module = device.api().create_shader_module(code)?;
        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        self.device.api().destroy_shader_module(self.module);
    }
}

/// Pipeline layout owned by a pipeline wrapper until the pipeline exists.
fn create_layout(
    device: &Device,
    set_layout: &DescriptorSetLayout,
    push_constants: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    device
        .api()
        .create_pipeline_layout(&[set_layout.handle()], push_constants)
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    /// Raw pipeline handle
    pub pipeline: vk::Pipeline,
    /// Layout the pipeline was created with
    pub layout: vk::PipelineLayout,
    device: Arc<Device>,
}

impl ComputePipeline {
    /// Create a compute pipeline from SPIR-V with a single descriptor set layout.
    pub fn new(
        device: &Arc<Device>,
        shader_code: &[u32],
        set_layout: &DescriptorSetLayout,
        push_constants: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let shader = ShaderModule::new(device, shader_code)?;
        let layout = create_layout(device, set_layout, push_constants)?;
        let pipeline = match device.api().create_compute_pipeline(shader.module, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.api().destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        Ok(Self {
            pipeline,
            layout,
            device: device.clone(),
        })
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let api = self.device.api();
        api.destroy_pipeline(self.pipeline);
        api.destroy_pipeline_layout(self.layout);
    }
}

/// Graphics pipeline configuration.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    /// Vertex stage SPIR-V; required
    pub vertex_shader: Vec<u32>,
    /// Tessellation control stage SPIR-V, set together with the evaluation stage
    pub tessellation_control_shader: Option<Vec<u32>>,
    /// Tessellation evaluation stage SPIR-V, set together with the control stage
    pub tessellation_evaluation_shader: Option<Vec<u32>>,
    /// Fragment stage SPIR-V; depth-only pipelines leave this unset
    pub fragment_shader: Option<Vec<u32>>,
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes read from `vertex_bindings`
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Topology used without tessellation; tessellation forces a patch list
    pub topology: vk::PrimitiveTopology,
    /// Vertices per patch; must be non-zero with tessellation
    pub patch_control_points: u32,
    /// Static viewport and scissor size
    pub extent: vk::Extent2D,
    /// Faces culled by the rasterizer
    pub cull_mode: vk::CullModeFlags,
    /// Winding of front-facing triangles
    pub front_face: vk::FrontFace,
    /// Rasterization sample count
    pub samples: vk::SampleCountFlags,
    /// Enable the depth test
    pub depth_test: bool,
    /// Write depth for fragments that pass the test
    pub depth_write: bool,
    /// Depth comparison operator
    pub depth_compare_op: vk::CompareOp,
    /// Color attachments of the subpass; zero for depth-only passes
    pub color_attachment_count: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            tessellation_control_shader: None,
            tessellation_evaluation_shader: None,
            fragment_shader: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            patch_control_points: 3,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            color_attachment_count: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Returns true if both tessellation stages are set.
    pub const fn has_tessellation(&self) -> bool {
        self.tessellation_control_shader.is_some() && self.tessellation_evaluation_shader.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.vertex_shader.is_empty() {
            return Err(GpuError::InvalidState("vertex shader is required".to_string()));
        }
        if self.tessellation_control_shader.is_some() != self.tessellation_evaluation_shader.is_some() {
            return Err(GpuError::InvalidState(
                "tessellation needs both control and evaluation shaders".to_string(),
            ));
        }
        if self.has_tessellation() && self.patch_control_points == 0 {
            return Err(GpuError::InvalidState(
                "patch control points must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    /// Raw pipeline handle
    pub pipeline: vk::Pipeline,
    /// Layout the pipeline was created with
    pub layout: vk::PipelineLayout,
    device: Arc<Device>,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline for subpass 0 of `render_pass`.
    pub fn new(
        device: &Arc<Device>,
        config: &GraphicsPipelineConfig,
        set_layout: &DescriptorSetLayout,
        push_constants: &[vk::PushConstantRange],
        render_pass: &RenderPass,
    ) -> Result<Self> {
        config.validate()?;

        let mut modules = vec![(
            vk::ShaderStageFlags::VERTEX,
            ShaderModule::new(device, &config.vertex_shader)?,
        )];
        if let (Some(control), Some(evaluation)) = (
            &config.tessellation_control_shader,
            &config.tessellation_evaluation_shader,
        ) {
            modules.push((
                vk::ShaderStageFlags::TESSELLATION_CONTROL,
                ShaderModule::new(device, control)?,
            ));
            modules.push((
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                ShaderModule::new(device, evaluation)?,
            ));
        }
        if let Some(fragment) = &config.fragment_shader {
            modules.push((
                vk::ShaderStageFlags::FRAGMENT,
                ShaderModule::new(device, fragment)?,
            ));
        }

        let (topology, patch_control_points) = if config.has_tessellation() {
            (
                vk::PrimitiveTopology::PATCH_LIST,
                Some(config.patch_control_points),
            )
        } else {
            (config.topology, None)
        };

        let layout = create_layout(device, set_layout, push_constants)?;
        let desc = GraphicsPipelineDesc {
            stages: modules
                .iter()
                .map(|(stage, module)| (*stage, module.module))
                .collect(),
            vertex_bindings: config.vertex_bindings.clone(),
            vertex_attributes: config.vertex_attributes.clone(),
            topology,
            patch_control_points,
            extent: config.extent,
            cull_mode: config.cull_mode,
            front_face: config.front_face,
            samples: config.samples,
            depth_test: config.depth_test,
            depth_write: config.depth_write,
            depth_compare_op: config.depth_compare_op,
            color_attachment_count: config.color_attachment_count,
            layout,
            render_pass: render_pass.handle(),
        };
        let pipeline = match device.api().create_graphics_pipeline(&desc) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.api().destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        Ok(Self {
            pipeline,
            layout,
            device: device.clone(),
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        let api = self.device.api();
        api.destroy_pipeline(self.pipeline);
        api.destroy_pipeline_layout(self.layout);
    }
}

/// Single-subpass render pass.
pub struct RenderPass {
    render_pass: vk::RenderPass,
    desc: RenderPassDesc,
    device: Arc<Device>,
}

impl RenderPass {
    /// Create a render pass.
    pub fn new(device: &Arc<Device>, desc: RenderPassDesc) -> Result<Self> {
        let render_pass = device.api().create_render_pass(&desc)?;
        Ok(Self {
            render_pass,
            desc,
            device: device.clone(),
        })
    }

    /// Depth-only pass that clears depth and leaves it in `final_layout`.
    pub fn depth_only(
        device: &Arc<Device>,
        format: vk::Format,
        final_layout: vk::ImageLayout,
    ) -> Result<Self> {
        Self::new(
            device,
            RenderPassDesc {
                color: Vec::new(),
                depth: Some(AttachmentDesc {
                    format,
                    final_layout,
                }),
            },
        )
    }

    /// Raw handle.
    pub const fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Attachments of the pass.
    pub const fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.api().destroy_render_pass(self.render_pass);
    }
}

/// Framebuffer over image views compatible with a render pass.
pub struct Framebuffer {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    device: Arc<Device>,
}

impl Framebuffer {
    /// Create a framebuffer; `attachments` are in render pass order.
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        attachments: &[&ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let expected = render_pass.desc.color.len() + usize::from(render_pass.desc.depth.is_some());
        if attachments.len() != expected {
            return Err(GpuError::InvalidState(format!(
                "render pass has {expected} attachments, got {}",
                attachments.len()
            )));
        }
        let framebuffer = device.api().create_framebuffer(&FramebufferDesc {
            render_pass: render_pass.handle(),
            attachments: attachments.iter().map(|view| view.view).collect(),
            extent,
        })?;
        Ok(Self {
            framebuffer,
            extent,
            device: device.clone(),
        })
    }

    /// Raw handle.
    pub const fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Framebuffer size.
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.api().destroy_framebuffer(self.framebuffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceRequirements, GpuContextBuilder};
    use crate::descriptors::DescriptorSetLayoutBuilder;
    use crate::mock::{mock_spirv, MockAdapter, MockInstance, ObjectKind};
    use crate::queue::Capability;

    fn context(mock: &Arc<MockInstance>) -> crate::GpuContext {
        GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Graphics]))
            .instance(mock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn compute_pipeline_destroys_shader_module_after_build() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let set_layout = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .unwrap();
        let pipeline = ComputePipeline::new(ctx.device(), &mock_spirv(1), &set_layout, &[]).unwrap();
        let ledger = mock.ledger();
        assert_eq!(ledger.created_count(ObjectKind::ShaderModule), 1);
        assert_eq!(ledger.live_count(ObjectKind::ShaderModule), 0);
        drop(pipeline);
        assert_eq!(
            mock.ledger().destroy_order(),
            vec![ObjectKind::ShaderModule, ObjectKind::Pipeline, ObjectKind::PipelineLayout]
        );
    }

    #[test]
    fn failed_pipeline_releases_layout_and_module() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let set_layout = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .unwrap();
        mock.fail_call("vkCreateComputePipelines");
        assert!(ComputePipeline::new(ctx.device(), &mock_spirv(1), &set_layout, &[]).is_err());
        let ledger = mock.ledger();
        assert_eq!(ledger.live_count(ObjectKind::PipelineLayout), 0);
        assert_eq!(ledger.live_count(ObjectKind::ShaderModule), 0);
    }

    #[test]
    fn tessellation_forces_patch_list() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let set_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
            .build(ctx.device())
            .unwrap();
        let render_pass = RenderPass::depth_only(
            ctx.device(),
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        let config = GraphicsPipelineConfig {
            vertex_shader: mock_spirv(10),
            tessellation_control_shader: Some(mock_spirv(11)),
            tessellation_evaluation_shader: Some(mock_spirv(12)),
            fragment_shader: Some(mock_spirv(13)),
            ..Default::default()
        };
        let _pipeline =
            GraphicsPipeline::new(ctx.device(), &config, &set_layout, &[], &render_pass).unwrap();
        let desc = mock.last_graphics_pipeline().unwrap();
        assert_eq!(desc.topology, vk::PrimitiveTopology::PATCH_LIST);
        assert_eq!(desc.patch_control_points, Some(3));
        assert_eq!(desc.stages.len(), 4);
        assert_eq!(desc.depth_compare_op, vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(desc.color_attachment_count, 0);
        assert_eq!(mock.ledger().live_count(ObjectKind::ShaderModule), 0);
    }

    #[test]
    fn half_tessellation_is_rejected() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let set_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(ctx.device())
            .unwrap();
        let render_pass = RenderPass::depth_only(
            ctx.device(),
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        let config = GraphicsPipelineConfig {
            vertex_shader: mock_spirv(10),
            tessellation_control_shader: Some(mock_spirv(11)),
            ..Default::default()
        };
        assert!(matches!(
            GraphicsPipeline::new(ctx.device(), &config, &set_layout, &[], &render_pass),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(mock.ledger().created_count(ObjectKind::ShaderModule), 0);
    }
}
