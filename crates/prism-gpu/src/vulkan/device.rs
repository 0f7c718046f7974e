//! `DeviceApi` over an `ash::Device`.

use crate::api::{
    Command, DescriptorResource, DescriptorWrite, DeviceApi, FramebufferDesc, GraphicsPipelineDesc,
    ImageDesc, LayoutBinding, RenderPassDesc, SamplerDesc,
};
use crate::error::{Result, VkResultExt};
use ash::vk;

/// A logical device created by [`VulkanInstance`](super::VulkanInstance).
pub struct VulkanDevice {
    device: ash::Device,
}

const fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn buffer_image_copy(aspect: vk::ImageAspectFlags, extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
}

impl VulkanDevice {
    pub(super) const fn new(device: ash::Device) -> Self {
        Self { device }
    }

    /// The wrapped `ash` device.
    pub const fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn map<F>(&self, memory: vk::DeviceMemory, offset: u64, len: usize, f: F) -> Result<()>
    where
        F: FnOnce(*mut u8),
    {
        if len == 0 {
            return Ok(());
        }
        // SAFETY: callers check host visibility and bounds before mapping.
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, len as u64, vk::MemoryMapFlags::empty())
        }
        .check("vkMapMemory")?;
        f(ptr.cast::<u8>());
        // SAFETY: mapped above.
        unsafe { self.device.unmap_memory(memory) };
        Ok(())
    }
}

impl DeviceApi for VulkanDevice {
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        // SAFETY: the family was requested at device creation.
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: valid create info.
        unsafe { self.device.create_buffer(&info, None) }.check("vkCreateBuffer")
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: the owning wrapper destroys each buffer once.
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: `buffer` is live.
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        // SAFETY: both handles are live and the allocation covers the requirements.
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }.check("vkBindBufferMemory")
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent_3d())
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: valid create info.
        unsafe { self.device.create_image(&info, None) }.check("vkCreateImage")
    }

    fn destroy_image(&self, image: vk::Image) {
        // SAFETY: the owning wrapper destroys each image once, after its views.
        unsafe { self.device.destroy_image(image, None) };
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: `image` is live.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()> {
        // SAFETY: both handles are live and the allocation covers the requirements.
        unsafe { self.device.bind_image_memory(image, memory, 0) }.check("vkBindImageMemory")
    }

    fn allocate_memory(&self, size: u64, type_index: u32) -> Result<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        // SAFETY: valid allocate info.
        unsafe { self.device.allocate_memory(&info, None) }.check("vkAllocateMemory")
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: freed once, after the resource bound to it is destroyed.
        unsafe { self.device.free_memory(memory, None) };
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        self.map(memory, offset, data.len(), |ptr| {
            // SAFETY: the mapping covers `data.len()` bytes.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        })
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        self.map(memory, offset, len, |ptr| {
            // SAFETY: the mapping covers `out.len()` bytes.
            unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
        })
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(full_range(aspect));
        // SAFETY: `image` is live.
        unsafe { self.device.create_image_view(&info, None) }.check("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: destroyed once by its owner.
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .max_lod(0.0);
        // SAFETY: valid create info.
        unsafe { self.device.create_sampler(&info, None) }.check("vkCreateSampler")
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: destroyed once by its owner.
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.kind.to_vk())
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: valid create info.
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .check("vkCreateDescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: destroyed once by its owner.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(sizes)
            .max_sets(max_sets);
        // SAFETY: valid create info.
        unsafe { self.device.create_descriptor_pool(&info, None) }.check("vkCreateDescriptorPool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: destroyed once, after every set is dropped.
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: pool and layout are live.
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.check("vkAllocateDescriptorSets")?;
        sets.into_iter()
            .next()
            .ok_or(crate::GpuError::ApiCall {
                call: "vkAllocateDescriptorSets",
                result: vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            })
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        for write in writes {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .descriptor_type(write.resource.kind().to_vk());
            match write.resource {
                DescriptorResource::UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | DescriptorResource::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => {
                    let info = [vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    }];
                    // SAFETY: the set and the buffer are live.
                    unsafe { self.device.update_descriptor_sets(&[base.buffer_info(&info)], &[]) };
                }
                DescriptorResource::StorageImage { view, layout } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    }];
                    // SAFETY: the set and the view are live.
                    unsafe { self.device.update_descriptor_sets(&[base.image_info(&info)], &[]) };
                }
                DescriptorResource::CombinedImageSampler {
                    view,
                    sampler,
                    layout,
                } => {
                    let info = [vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: layout,
                    }];
                    // SAFETY: the set, view and sampler are live.
                    unsafe { self.device.update_descriptor_sets(&[base.image_info(&info)], &[]) };
                }
            }
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: valid create info.
        unsafe { self.device.create_shader_module(&info, None) }.check("vkCreateShaderModule")
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: destroyed once by its owner.
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        // SAFETY: valid create info.
        unsafe { self.device.create_pipeline_layout(&info, None) }.check("vkCreatePipelineLayout")
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: destroyed once, after its pipeline.
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_compute_pipeline(&self, module: vk::ShaderModule, layout: vk::PipelineLayout) -> Result<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        // SAFETY: module and layout are live.
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| e)
        .check("vkCreateComputePipelines")?;
        Ok(pipelines[0])
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc
            .stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(desc.patch_control_points.unwrap_or(0));

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: desc.extent,
        }];
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(desc.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare_op);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..desc.color_attachment_count)
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0);
        if desc.patch_control_points.is_some() {
            info = info.tessellation_state(&tessellation);
        }

        // SAFETY: every referenced state outlives the call.
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| e)
        .check("vkCreateGraphicsPipelines")?;
        Ok(pipelines[0])
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: destroyed once, after the device is idle.
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        let attachment = |a: &crate::api::AttachmentDesc| {
            vk::AttachmentDescription::default()
                .format(a.format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(a.final_layout)
        };
        let attachments: Vec<vk::AttachmentDescription> =
            desc.color.iter().chain(desc.depth.iter()).map(attachment).collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.color.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass];

        let attachment_stages = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let attachment_writes =
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        let consumer_stages = vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER
            | vk::PipelineStageFlags::TRANSFER;
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(consumer_stages)
                .dst_stage_mask(attachment_stages)
                .src_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(attachment_writes),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(consumer_stages)
                .src_access_mask(attachment_writes)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ),
        ];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        // SAFETY: every referenced array outlives the call.
        unsafe { self.device.create_render_pass(&info, None) }.check("vkCreateRenderPass")
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: destroyed once, after its framebuffers and pipelines.
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(&desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        // SAFETY: the render pass and views are live.
        unsafe { self.device.create_framebuffer(&info, None) }.check("vkCreateFramebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: destroyed once by its owner.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_command_pool(&self, family: u32, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(flags);
        // SAFETY: valid create info.
        unsafe { self.device.create_command_pool(&info, None) }.check("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: destroyed once, after its command buffers are freed.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: `pool` is live.
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }.check("vkAllocateCommandBuffers")?;
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        // SAFETY: `cmd` was allocated from `pool` and is not pending.
        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> Result<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: `cmd` is not recording or pending.
        unsafe { self.device.begin_command_buffer(cmd, &info) }.check("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: `cmd` is recording.
        unsafe { self.device.end_command_buffer(cmd) }.check("vkEndCommandBuffer")
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        let d = &self.device;
        // SAFETY: `cmd` is recording and every handle in `command` is live.
        unsafe {
            match command {
                Command::ImageBarrier(barrier) => {
                    let barriers = [vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(barrier.src_stage)
                        .src_access_mask(barrier.src_access)
                        .dst_stage_mask(barrier.dst_stage)
                        .dst_access_mask(barrier.dst_access)
                        .old_layout(barrier.old_layout)
                        .new_layout(barrier.new_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(barrier.image)
                        .subresource_range(full_range(barrier.aspect))];
                    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    d.cmd_pipeline_barrier2(cmd, &dependency);
                }
                Command::CopyBuffer { src, dst, size } => {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: *size,
                    };
                    d.cmd_copy_buffer(cmd, *src, *dst, &[region]);
                }
                Command::CopyBufferToImage {
                    buffer,
                    image,
                    layout,
                    aspect,
                    extent,
                } => {
                    d.cmd_copy_buffer_to_image(
                        cmd,
                        *buffer,
                        *image,
                        *layout,
                        &[buffer_image_copy(*aspect, *extent)],
                    );
                }
                Command::CopyImageToBuffer {
                    image,
                    layout,
                    aspect,
                    buffer,
                    extent,
                } => {
                    d.cmd_copy_image_to_buffer(
                        cmd,
                        *image,
                        *layout,
                        *buffer,
                        &[buffer_image_copy(*aspect, *extent)],
                    );
                }
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => d.cmd_bind_pipeline(cmd, *bind_point, *pipeline),
                Command::BindDescriptorSet {
                    bind_point,
                    layout,
                    set,
                } => d.cmd_bind_descriptor_sets(cmd, *bind_point, *layout, 0, &[*set], &[]),
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => d.cmd_push_constants(cmd, *layout, *stages, *offset, data),
                Command::Dispatch { groups } => d.cmd_dispatch(cmd, groups[0], groups[1], groups[2]),
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_values,
                } => {
                    let clears: Vec<vk::ClearValue> = clear_values.iter().map(|c| c.to_vk()).collect();
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: *extent,
                        })
                        .clear_values(&clears);
                    d.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => d.cmd_end_render_pass(cmd),
                Command::BindVertexBuffer { buffer, offset } => {
                    d.cmd_bind_vertex_buffers(cmd, 0, &[*buffer], &[*offset]);
                }
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => d.cmd_bind_index_buffer(cmd, *buffer, *offset, *index_type),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => d.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
            }
        }
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        // SAFETY: valid create info.
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }.check("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: the fence is not pending.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        // SAFETY: `fence` is live.
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(crate::GpuError::ApiCall {
                call: "vkWaitForFences",
                result,
            }),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        // SAFETY: `fence` is not pending.
        unsafe { self.device.reset_fences(&[fence]) }.check("vkResetFences")
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()> {
        let submit = vk::SubmitInfo::default().command_buffers(command_buffers);
        // SAFETY: every command buffer is executable.
        unsafe { self.device.queue_submit(queue, &[submit], fence) }.check("vkQueueSubmit")
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        // SAFETY: `queue` belongs to this device.
        unsafe { self.device.queue_wait_idle(queue) }.check("vkQueueWaitIdle")
    }

    fn device_wait_idle(&self) -> Result<()> {
        // SAFETY: no preconditions.
        unsafe { self.device.device_wait_idle() }.check("vkDeviceWaitIdle")
    }

    fn destroy_device(&self) {
        // SAFETY: called once, after every child object is destroyed.
        unsafe { self.device.destroy_device(None) };
    }
}
