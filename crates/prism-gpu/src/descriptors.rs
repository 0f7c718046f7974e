//! Descriptor set management.

use crate::api::{DescriptorKind, DescriptorResource, DescriptorWrite, LayoutBinding};
use crate::context::Device;
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, ImageView, Sampler};
use ash::vk;
use std::sync::Arc;

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(mut self, binding: u32, kind: DescriptorKind, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            kind,
            stages,
        });
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorKind::StorageBuffer, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorKind::UniformBuffer, stages)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorKind::StorageImage, stages)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, DescriptorKind::CombinedImageSampler, stages)
    }

    /// Build the descriptor set layout.
    ///
    /// Fails if a binding index appears twice.
    pub fn build(self, device: &Arc<Device>) -> Result<DescriptorSetLayout> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(GpuError::DescriptorMismatch(format!(
                    "binding {} declared twice",
                    binding.binding
                )));
            }
        }
        let layout = device.api().create_descriptor_set_layout(&self.bindings)?;
        Ok(DescriptorSetLayout {
            layout,
            bindings: self.bindings,
            device: device.clone(),
        })
    }
}

/// A descriptor set layout and the bindings it was built from.
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    device: Arc<Device>,
}

impl DescriptorSetLayout {
    /// Raw handle.
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.api().destroy_descriptor_set_layout(self.layout);
    }
}

/// Pool sizes covering one set of each layout.
pub fn pool_sizes(layouts: &[&DescriptorSetLayout]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in layouts.iter().flat_map(|layout| layout.bindings.iter()) {
        let ty = binding.kind.to_vk();
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Arc<Device>,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    pub fn new(
        device: &Arc<Device>,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<Arc<Self>> {
        let pool = device.api().create_descriptor_pool(pool_sizes, max_sets)?;
        Ok(Arc::new(Self {
            pool,
            device: device.clone(),
        }))
    }

    /// Create a pool with room for exactly one set of each layout.
    pub fn for_layouts(device: &Arc<Device>, layouts: &[&DescriptorSetLayout]) -> Result<Arc<Self>> {
        Self::new(device, &pool_sizes(layouts), layouts.len() as u32)
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set of `layout`. The set keeps the pool alive.
    pub fn allocate(self: &Arc<Self>, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        let set = self
            .device
            .api()
            .allocate_descriptor_set(self.pool, layout.layout)?;
        Ok(DescriptorSet {
            set,
            bindings: layout.bindings.clone(),
            pool: self.clone(),
        })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.api().destroy_descriptor_pool(self.pool);
    }
}

/// A descriptor set; freed together with its pool.
pub struct DescriptorSet {
    set: vk::DescriptorSet,
    bindings: Vec<LayoutBinding>,
    pool: Arc<DescriptorPool>,
}

impl DescriptorSet {
    /// Raw handle.
    pub const fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Write descriptors after checking each against the layout.
    pub fn write(&self, writes: &[DescriptorWrite]) -> Result<()> {
        for write in writes {
            let binding = self
                .bindings
                .iter()
                .find(|b| b.binding == write.binding)
                .ok_or_else(|| {
                    GpuError::DescriptorMismatch(format!(
                        "binding {} is not in the layout",
                        write.binding
                    ))
                })?;
            if binding.kind != write.resource.kind() {
                return Err(GpuError::DescriptorMismatch(format!(
                    "binding {} is {:?}, got {:?}",
                    write.binding,
                    binding.kind,
                    write.resource.kind()
                )));
            }
        }
        self.pool.device.api().update_descriptor_set(self.set, writes);
        Ok(())
    }
}

/// Uniform buffer write covering the whole buffer.
pub fn write_uniform_buffer(binding: u32, buffer: &GpuBuffer) -> DescriptorWrite {
    DescriptorWrite {
        binding,
        resource: DescriptorResource::UniformBuffer {
            buffer: buffer.buffer,
            offset: 0,
            range: buffer.size,
        },
    }
}

/// Storage buffer write covering the whole buffer.
pub fn write_storage_buffer(binding: u32, buffer: &GpuBuffer) -> DescriptorWrite {
    DescriptorWrite {
        binding,
        resource: DescriptorResource::StorageBuffer {
            buffer: buffer.buffer,
            offset: 0,
            range: buffer.size,
        },
    }
}

/// Storage image write; the image is accessed in `GENERAL` layout.
pub fn write_storage_image(binding: u32, view: &ImageView) -> DescriptorWrite {
    DescriptorWrite {
        binding,
        resource: DescriptorResource::StorageImage {
            view: view.view,
            layout: vk::ImageLayout::GENERAL,
        },
    }
}

/// Combined image sampler write.
pub fn write_sampled_image(
    binding: u32,
    view: &ImageView,
    sampler: &Sampler,
    layout: vk::ImageLayout,
) -> DescriptorWrite {
    DescriptorWrite {
        binding,
        resource: DescriptorResource::CombinedImageSampler {
            view: view.view,
            sampler: sampler.sampler,
            layout,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceRequirements, GpuContextBuilder};
    use crate::mock::{MockAdapter, MockInstance, ObjectKind};
    use crate::queue::Capability;

    fn context(mock: &Arc<MockInstance>) -> crate::GpuContext {
        GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Compute]))
            .instance(mock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_binding_index_fails() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let err = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::DescriptorMismatch(_)));
        assert_eq!(mock.ledger().created_count(ObjectKind::DescriptorSetLayout), 0);
    }

    #[test]
    fn pool_sizes_count_each_kind() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let layout = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
            .storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .storage_image(2, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .unwrap();
        let sizes = pool_sizes(&[&layout]);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 2);
    }

    #[test]
    fn writes_are_validated_against_layout() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .unwrap();
        let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout]).unwrap();
        let set = pool.allocate(&layout).unwrap();
        let buffer = allocator
            .create_host_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();

        assert!(set.write(&[write_uniform_buffer(0, &buffer)]).is_ok());
        assert!(matches!(
            set.write(&[write_uniform_buffer(3, &buffer)]),
            Err(GpuError::DescriptorMismatch(_))
        ));
        assert!(matches!(
            set.write(&[write_storage_buffer(0, &buffer)]),
            Err(GpuError::DescriptorMismatch(_))
        ));
        assert!(mock.ledger().violations().is_empty());
    }

    #[test]
    fn set_keeps_pool_alive() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let layout = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())
            .unwrap();
        let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout]).unwrap();
        let set = pool.allocate(&layout).unwrap();
        drop(pool);
        assert_eq!(mock.ledger().live_count(ObjectKind::DescriptorPool), 1);
        drop(set);
        assert_eq!(mock.ledger().live_count(ObjectKind::DescriptorPool), 0);
    }
}
