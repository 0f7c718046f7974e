//! Backend interface between the GPU components and the driver.
//!
//! Every Vulkan call made by this crate goes through [`InstanceApi`] or
//! [`DeviceApi`]. The [`vulkan`](crate::vulkan) module implements them over
//! `ash`; the [`mock`](crate::mock) module implements them in software for
//! tests. Handles are plain `ash::vk` handles in both backends.
//!
//! Create and destroy calls carry no ownership: the RAII wrappers in the rest
//! of the crate are responsible for destroying each handle exactly once.

use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Identifying properties of a physical device.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    /// Device name as reported by the driver
    pub name: String,
    /// Discrete, integrated, CPU, ...
    pub device_type: vk::PhysicalDeviceType,
    /// Supported Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// PCI vendor ID
    pub vendor_id: u32,
    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,
}

/// Memory types and heaps of a physical device.
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    /// Memory types in driver order
    pub types: Vec<vk::MemoryType>,
    /// Memory heaps in driver order
    pub heaps: Vec<vk::MemoryHeap>,
}

impl MemoryProperties {
    /// Total size of device-local heaps in bytes.
    pub fn device_local_bytes(&self) -> u64 {
        self.heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

/// Logical device creation parameters.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    /// Distinct queue families; one queue with priority 1.0 is created for each
    pub queue_families: Vec<u32>,
    /// Core features to enable
    pub features: vk::PhysicalDeviceFeatures,
    /// Device extensions to enable
    pub extensions: Vec<String>,
}

/// Image creation parameters (2D, one mip level, one layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Image size in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Optimal or linear tiling
    pub tiling: vk::ImageTiling,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// Extent as a 3D extent with depth 1.
    pub const fn extent_3d(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.extent.width,
            height: self.extent.height,
            depth: 1,
        }
    }
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Magnification and minification filter
    pub filter: vk::Filter,
    /// Address mode for all three axes
    pub address_mode: vk::SamplerAddressMode,
    /// Anisotropy level, `None` disables anisotropic filtering
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }
}

/// Kind of resource a descriptor binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Uniform buffer
    UniformBuffer,
    /// Storage buffer
    StorageBuffer,
    /// Storage image
    StorageImage,
    /// Combined image sampler
    CombinedImageSampler,
}

impl DescriptorKind {
    /// Vulkan descriptor type for this kind.
    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    /// Binding index
    pub binding: u32,
    /// Resource kind
    pub kind: DescriptorKind,
    /// Shader stages that see the binding
    pub stages: vk::ShaderStageFlags,
}

/// Resource written into a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Uniform buffer range
    UniformBuffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Start of the range
        offset: u64,
        /// Range size
        range: u64,
    },
    /// Storage buffer range
    StorageBuffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Start of the range
        offset: u64,
        /// Range size
        range: u64,
    },
    /// Storage image view
    StorageImage {
        /// View handle
        view: vk::ImageView,
        /// Layout the image is in when accessed
        layout: vk::ImageLayout,
    },
    /// Sampled image view with sampler
    CombinedImageSampler {
        /// View handle
        view: vk::ImageView,
        /// Sampler handle
        sampler: vk::Sampler,
        /// Layout the image is in when accessed
        layout: vk::ImageLayout,
    },
}

impl DescriptorResource {
    /// The descriptor kind this resource fills.
    pub const fn kind(&self) -> DescriptorKind {
        match self {
            Self::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            Self::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            Self::StorageImage { .. } => DescriptorKind::StorageImage,
            Self::CombinedImageSampler { .. } => DescriptorKind::CombinedImageSampler,
        }
    }
}

/// A single descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Target binding index
    pub binding: u32,
    /// Resource to bind
    pub resource: DescriptorResource,
}

/// Attachment of a render pass (cleared on load, stored, initial layout undefined).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    /// Attachment format
    pub format: vk::Format,
    /// Layout the attachment is left in after the pass
    pub final_layout: vk::ImageLayout,
}

/// Single-subpass render pass description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPassDesc {
    /// Color attachments
    pub color: Vec<AttachmentDesc>,
    /// Optional depth attachment
    pub depth: Option<AttachmentDesc>,
}

/// Framebuffer description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Attachment views in render pass order (colors, then depth)
    pub attachments: Vec<vk::ImageView>,
    /// Framebuffer size
    pub extent: vk::Extent2D,
}

/// Graphics pipeline description; all state except the shaders is fixed.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    /// Shader stages with their modules; entry point is always `main`
    pub stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Patch control points when tessellation stages are present
    pub patch_control_points: Option<u32>,
    /// Viewport and scissor extent
    pub extent: vk::Extent2D,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Front face winding
    pub front_face: vk::FrontFace,
    /// Rasterization samples
    pub samples: vk::SampleCountFlags,
    /// Depth test enable
    pub depth_test: bool,
    /// Depth write enable
    pub depth_write: bool,
    /// Depth compare op
    pub depth_compare_op: vk::CompareOp,
    /// Number of color attachments (blending disabled on all)
    pub color_attachment_count: u32,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Render pass the pipeline is used with (subpass 0)
    pub render_pass: vk::RenderPass,
}

/// Image layout barrier with synchronization2 scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Target image
    pub image: vk::Image,
    /// Aspect of the whole image to transition
    pub aspect: vk::ImageAspectFlags,
    /// Current layout
    pub old_layout: vk::ImageLayout,
    /// New layout
    pub new_layout: vk::ImageLayout,
    /// Source stage scope
    pub src_stage: vk::PipelineStageFlags2,
    /// Source access scope
    pub src_access: vk::AccessFlags2,
    /// Destination stage scope
    pub dst_stage: vk::PipelineStageFlags2,
    /// Destination access scope
    pub dst_access: vk::AccessFlags2,
}

/// Clear value for a render pass attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Float color
    Color([f32; 4]),
    /// Depth and stencil
    DepthStencil {
        /// Depth clear value
        depth: f32,
        /// Stencil clear value
        stencil: u32,
    },
}

impl ClearValue {
    /// Convert into the Vulkan union.
    pub const fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// A command recorded into a command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Image layout transition
    ImageBarrier(ImageBarrier),
    /// Copy `size` bytes from the start of `src` to the start of `dst`
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Byte count
        size: u64,
    },
    /// Copy tightly packed buffer data into the full image extent
    CopyBufferToImage {
        /// Source buffer
        buffer: vk::Buffer,
        /// Destination image
        image: vk::Image,
        /// Layout the image is in
        layout: vk::ImageLayout,
        /// Aspect to copy
        aspect: vk::ImageAspectFlags,
        /// Image extent
        extent: vk::Extent2D,
    },
    /// Copy the full image extent into tightly packed buffer data
    CopyImageToBuffer {
        /// Source image
        image: vk::Image,
        /// Layout the image is in
        layout: vk::ImageLayout,
        /// Aspect to copy
        aspect: vk::ImageAspectFlags,
        /// Destination buffer
        buffer: vk::Buffer,
        /// Image extent
        extent: vk::Extent2D,
    },
    /// Bind a pipeline
    BindPipeline {
        /// Compute or graphics
        bind_point: vk::PipelineBindPoint,
        /// Pipeline handle
        pipeline: vk::Pipeline,
    },
    /// Bind a descriptor set at set index 0
    BindDescriptorSet {
        /// Compute or graphics
        bind_point: vk::PipelineBindPoint,
        /// Layout of the bound pipeline
        layout: vk::PipelineLayout,
        /// Set handle
        set: vk::DescriptorSet,
    },
    /// Update push constants
    PushConstants {
        /// Layout of the bound pipeline
        layout: vk::PipelineLayout,
        /// Stages that read the range
        stages: vk::ShaderStageFlags,
        /// Byte offset
        offset: u32,
        /// Bytes to push
        data: Vec<u8>,
    },
    /// Dispatch compute workgroups
    Dispatch {
        /// Workgroup counts
        groups: [u32; 3],
    },
    /// Begin a render pass over the full framebuffer
    BeginRenderPass {
        /// Render pass handle
        render_pass: vk::RenderPass,
        /// Framebuffer handle
        framebuffer: vk::Framebuffer,
        /// Render area
        extent: vk::Extent2D,
        /// One clear value per attachment
        clear_values: Vec<ClearValue>,
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a vertex buffer at binding 0
    BindVertexBuffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Byte offset
        offset: u64,
    },
    /// Bind an index buffer
    BindIndexBuffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Byte offset
        offset: u64,
        /// Index width
        index_type: vk::IndexType,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices per instance
        index_count: u32,
        /// Instance count
        instance_count: u32,
        /// First index
        first_index: u32,
        /// Added to each index
        vertex_offset: i32,
        /// First instance
        first_instance: u32,
    },
}

/// Instance-level calls.
pub trait InstanceApi: Send + Sync {
    /// List physical devices in driver order.
    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>>;

    /// Identifying properties and limits.
    fn adapter_info(&self, physical_device: vk::PhysicalDevice) -> AdapterInfo;

    /// Supported core features.
    fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures;

    /// Queue families in index order.
    fn queue_families(&self, physical_device: vk::PhysicalDevice)
        -> Vec<vk::QueueFamilyProperties>;

    /// Memory types and heaps.
    fn memory_properties(&self, physical_device: vk::PhysicalDevice) -> MemoryProperties;

    /// Names of supported device extensions.
    fn device_extensions(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<String>>;

    /// Whether `family` can present to `surface`.
    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool>;

    /// Create a logical device.
    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> Result<Arc<dyn DeviceApi>>;

    /// Destroy the instance. Called exactly once, after every device is gone.
    fn destroy_instance(&self);
}

/// Device-level calls.
pub trait DeviceApi: Send + Sync {
    /// Queue handle for `(family, index)`.
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue;

    /// Create a buffer without memory.
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    /// Destroy a buffer.
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Memory requirements of a buffer.
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    /// Bind memory at offset 0.
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()>;

    /// Create an image without memory.
    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image>;
    /// Destroy an image.
    fn destroy_image(&self, image: vk::Image);
    /// Memory requirements of an image.
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    /// Bind memory at offset 0.
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()>;

    /// Allocate `size` bytes from memory type `type_index`.
    fn allocate_memory(&self, size: u64, type_index: u32) -> Result<vk::DeviceMemory>;
    /// Free an allocation.
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Copy bytes into host-visible memory.
    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()>;
    /// Copy bytes out of host-visible memory.
    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Create a 2D view over the whole image.
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    /// Destroy a view.
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Create a sampler.
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    /// Destroy a sampler.
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Create a descriptor set layout.
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    /// Destroy a descriptor set layout.
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Create a descriptor pool.
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool>;
    /// Destroy a descriptor pool and every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocate one set.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;
    /// Write descriptors into a set.
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    /// Create a shader module from SPIR-V words.
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    /// Destroy a shader module.
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    /// Create a pipeline layout.
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    /// Destroy a pipeline layout.
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Create a compute pipeline with entry point `main`.
    fn create_compute_pipeline(
        &self,
        module: vk::ShaderModule,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline>;
    /// Create a graphics pipeline.
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline>;
    /// Destroy a pipeline.
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Create a render pass.
    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;
    /// Destroy a render pass.
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a framebuffer.
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<vk::Framebuffer>;
    /// Destroy a framebuffer.
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Create a command pool for `family`.
    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;
    /// Destroy a command pool.
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate one primary command buffer.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    /// Return a command buffer to its pool.
    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);
    /// Begin recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> Result<()>;
    /// End recording.
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    /// Record one command.
    fn record(&self, cmd: vk::CommandBuffer, command: &Command);

    /// Create an unsignaled fence.
    fn create_fence(&self) -> Result<vk::Fence>;
    /// Destroy a fence.
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for a fence. Returns `Ok(false)` on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    /// Reset a fence to unsignaled.
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Submit command buffers, optionally signaling `fence`.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Result<()>;
    /// Block until `queue` is idle.
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
    /// Block until the whole device is idle.
    fn device_wait_idle(&self) -> Result<()>;

    /// Destroy the logical device. Called exactly once, after every child.
    fn destroy_device(&self);
}
