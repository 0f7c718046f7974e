//! GPU memory management.
//!
//! Every buffer and image gets its own dedicated allocation, chosen by
//! [`find_memory_type`] and bound before the wrapper is handed out.

use crate::api::{ImageDesc, MemoryProperties, SamplerDesc};
use crate::command::CommandPool;
use crate::context::Device;
use crate::error::{GpuError, Result};
use crate::queue::Queue;
use ash::vk;
use std::sync::Arc;

/// First memory type allowed by `type_bits` whose flags contain `properties`.
pub fn find_memory_type(
    memory: &MemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory
        .types
        .iter()
        .enumerate()
        .take(32)
        .find(|(index, ty)| {
            type_bits & (1 << index) != 0 && ty.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
        .ok_or(GpuError::NoMatchingMemoryType {
            type_bits,
            properties,
        })
}

/// A dedicated device memory allocation.
struct Allocation {
    memory: vk::DeviceMemory,
    size: u64,
    flags: vk::MemoryPropertyFlags,
}

fn allocate(
    device: &Device,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<Allocation> {
    let memory = device.memory_properties();
    let type_index = find_memory_type(memory, requirements.memory_type_bits, properties)?;
    let flags = memory.types[type_index as usize].property_flags;
    let handle = device.api().allocate_memory(requirements.size, type_index)?;
    Ok(Allocation {
        memory: handle,
        size: requirements.size,
        flags,
    })
}

/// A GPU buffer with its dedicated allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    /// Requested size in bytes
    pub size: u64,
    allocation_size: u64,
    memory_flags: vk::MemoryPropertyFlags,
    device: Arc<Device>,
}

impl GpuBuffer {
    /// Create a buffer and bind a dedicated allocation with `properties`.
    pub fn new(
        device: &Arc<Device>,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let api = device.api();
        let buffer = api.create_buffer(size, usage)?;
        let requirements = api.buffer_memory_requirements(buffer);
        let allocation = match allocate(device, requirements, properties) {
            Ok(allocation) => allocation,
            Err(e) => {
                api.destroy_buffer(buffer);
                return Err(e);
            }
        };
        if let Err(e) = api.bind_buffer_memory(buffer, allocation.memory) {
            api.destroy_buffer(buffer);
            api.free_memory(allocation.memory);
            return Err(e);
        }

        Ok(Self {
            buffer,
            memory: allocation.memory,
            size,
            allocation_size: allocation.size,
            memory_flags: allocation.flags,
            device: device.clone(),
        })
    }

    /// Size of the backing allocation (at least [`GpuBuffer::size`]).
    pub const fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    /// Property flags of the memory type backing this buffer.
    pub const fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Returns true if the buffer can be accessed from the host.
    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if !self.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        let end = offset.checked_add(len as u64).unwrap_or(u64::MAX);
        if end > self.size {
            return Err(GpuError::OutOfBounds {
                offset,
                end,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.device.api().write_memory(self.memory, offset, data)
    }

    /// Read raw bytes from the buffer at the given offset (must be host-visible).
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        self.device.api().read_memory(self.memory, offset, out)
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Read `count` elements from the start of the buffer (must be host-visible).
    pub fn read<T: bytemuck::Pod>(&self, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.read_bytes(0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        let api = self.device.api();
        api.destroy_buffer(self.buffer);
        api.free_memory(self.memory);
    }
}

/// A GPU image with its dedicated allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub desc: ImageDesc,
    device: Arc<Device>,
}

impl GpuImage {
    /// Create an image and bind a dedicated allocation with `properties`.
    pub fn new(
        device: &Arc<Device>,
        desc: ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let api = device.api();
        let image = api.create_image(&desc)?;
        let requirements = api.image_memory_requirements(image);
        let allocation = match allocate(device, requirements, properties) {
            Ok(allocation) => allocation,
            Err(e) => {
                api.destroy_image(image);
                return Err(e);
            }
        };
        if let Err(e) = api.bind_image_memory(image, allocation.memory) {
            api.destroy_image(image);
            api.free_memory(allocation.memory);
            return Err(e);
        }

        Ok(Self {
            image,
            memory: allocation.memory,
            desc,
            device: device.clone(),
        })
    }

    /// Image size in pixels.
    pub const fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    /// Pixel format.
    pub const fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Aspect covering the whole image, derived from the format.
    pub const fn aspect(&self) -> vk::ImageAspectFlags {
        format_aspect(self.desc.format)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        let api = self.device.api();
        api.destroy_image(self.image);
        api.free_memory(self.memory);
    }
}

/// Aspect flags for a format.
pub const fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel of the formats used by this crate.
pub const fn format_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        _ => 4,
    }
}

/// A view over a whole image. Keeps the image alive.
pub struct ImageView {
    pub view: vk::ImageView,
    image: Arc<GpuImage>,
}

impl ImageView {
    /// Create a 2D view over `image`.
    pub fn new(image: &Arc<GpuImage>, aspect: vk::ImageAspectFlags) -> Result<Self> {
        let view = image
            .device
            .api()
            .create_image_view(image.image, image.format(), aspect)?;
        Ok(Self {
            view,
            image: image.clone(),
        })
    }

    /// The viewed image.
    pub const fn image(&self) -> &Arc<GpuImage> {
        &self.image
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.image.device.api().destroy_image_view(self.view);
    }
}

/// A texture sampler.
pub struct Sampler {
    pub sampler: vk::Sampler,
    device: Arc<Device>,
}

impl Sampler {
    /// Create a sampler.
    pub fn new(device: &Arc<Device>, desc: &SamplerDesc) -> Result<Self> {
        let sampler = device.api().create_sampler(desc)?;
        Ok(Self {
            sampler,
            device: device.clone(),
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.api().destroy_sampler(self.sampler);
    }
}

/// Creates resources and runs one-shot transfers on one queue.
pub struct GpuAllocator {
    pub(crate) device: Arc<Device>,
    pub(crate) pool: Arc<CommandPool>,
    pub(crate) queue: Queue,
}

impl GpuAllocator {
    /// Create an allocator that submits one-shot work from `pool` to `queue`.
    pub const fn new(device: Arc<Device>, pool: Arc<CommandPool>, queue: Queue) -> Self {
        Self {
            device,
            pool,
            queue,
        }
    }

    /// Owning device.
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(&self.device, size, usage, properties)
    }

    /// Allocate a host-visible, host-coherent buffer.
    pub fn create_host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        self.create_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Allocate an image.
    pub fn create_image(
        &self,
        desc: ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Arc<GpuImage>> {
        GpuImage::new(&self.device, desc, properties).map(Arc::new)
    }

    /// Create a view over a whole image.
    pub fn create_image_view(
        &self,
        image: &Arc<GpuImage>,
        aspect: vk::ImageAspectFlags,
    ) -> Result<ImageView> {
        ImageView::new(image, aspect)
    }

    /// Create a sampler.
    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        Sampler::new(&self.device, desc)
    }
}
