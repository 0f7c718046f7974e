//! One-shot layout transitions and copies.

use crate::api::{ImageBarrier, ImageDesc};
use crate::command::execute_single_time_commands;
use crate::error::{GpuError, Result};
use crate::memory::{format_size, GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;
use std::sync::Arc;

/// Access and stage scopes of a supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    /// Source access scope
    pub src_access: vk::AccessFlags2,
    /// Destination access scope
    pub dst_access: vk::AccessFlags2,
    /// Source stage scope
    pub src_stage: vk::PipelineStageFlags2,
    /// Destination stage scope
    pub dst_stage: vk::PipelineStageFlags2,
}

/// Look up the barrier scopes for `old -> new`.
///
/// Only the transitions used by the compute and transfer paths are known;
/// anything else is [`GpuError::UnsupportedLayoutTransition`].
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    let shader_rw = vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
    let transition = match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => LayoutTransition {
            src_access: vk::AccessFlags2::NONE,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
        },
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::GENERAL) => LayoutTransition {
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access: shader_rw,
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        },
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL) => LayoutTransition {
            src_access: vk::AccessFlags2::NONE,
            dst_access: shader_rw,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        },
        (vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => LayoutTransition {
            src_access: vk::AccessFlags2::SHADER_WRITE,
            dst_access: vk::AccessFlags2::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
        },
        _ => return Err(GpuError::UnsupportedLayoutTransition { old, new }),
    };
    Ok(transition)
}

/// Barrier moving all of `image` from `old` to `new`.
pub fn image_barrier(
    image: &GpuImage,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<ImageBarrier> {
    let scopes = layout_transition(old, new)?;
    Ok(ImageBarrier {
        image: image.image,
        aspect: image.aspect(),
        old_layout: old,
        new_layout: new,
        src_stage: scopes.src_stage,
        src_access: scopes.src_access,
        dst_stage: scopes.dst_stage,
        dst_access: scopes.dst_access,
    })
}

/// Tightly packed byte size of an image.
pub const fn image_byte_size(desc: &ImageDesc) -> u64 {
    desc.extent.width as u64 * desc.extent.height as u64 * format_size(desc.format)
}

impl GpuAllocator {
    /// Transition `image` from `old` to `new` and wait for completion.
    ///
    /// Unsupported pairs fail before anything is recorded.
    pub fn transition_image_layout(
        &self,
        image: &GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let barrier = image_barrier(image, old, new)?;
        execute_single_time_commands(&self.pool, self.queue, |cmd| {
            cmd.image_barrier(barrier);
            Ok(())
        })
    }

    /// Copy `size` bytes from `src` to `dst` and wait for completion.
    pub fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, size: u64) -> Result<()> {
        if size > src.size || size > dst.size {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                end: size,
                size: src.size.min(dst.size),
            });
        }
        execute_single_time_commands(&self.pool, self.queue, |cmd| {
            cmd.copy_buffer(src, dst, size);
            Ok(())
        })
    }

    /// Copy tightly packed `buffer` data into the whole `image`, which must be
    /// in `layout`.
    pub fn copy_buffer_to_image(
        &self,
        buffer: &GpuBuffer,
        image: &GpuImage,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.check_image_buffer(buffer, image)?;
        execute_single_time_commands(&self.pool, self.queue, |cmd| {
            cmd.copy_buffer_to_image(buffer, image, layout);
            Ok(())
        })
    }

    /// Copy the whole `image`, which must be in `layout`, into `buffer`.
    pub fn copy_image_to_buffer(
        &self,
        image: &GpuImage,
        layout: vk::ImageLayout,
        buffer: &GpuBuffer,
    ) -> Result<()> {
        self.check_image_buffer(buffer, image)?;
        execute_single_time_commands(&self.pool, self.queue, |cmd| {
            cmd.copy_image_to_buffer(image, layout, buffer);
            Ok(())
        })
    }

    fn check_image_buffer(&self, buffer: &GpuBuffer, image: &GpuImage) -> Result<()> {
        let needed = image_byte_size(&image.desc);
        if needed > buffer.size {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                end: needed,
                size: buffer.size,
            });
        }
        Ok(())
    }

    /// Create a host-visible staging buffer holding `data`.
    ///
    /// Empty `data` is rejected with [`GpuError::InvalidState`].
    pub fn create_staging_buffer(&self, data: &[u8]) -> Result<GpuBuffer> {
        if data.is_empty() {
            return Err(GpuError::InvalidState(
                "cannot stage an empty upload".to_string(),
            ));
        }
        let staging =
            self.create_host_buffer(data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        staging.write_bytes(0, data)?;
        Ok(staging)
    }

    /// Upload `data` into a new device-local buffer through a staging buffer.
    pub fn upload_buffer(&self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        let staging = self.create_staging_buffer(data)?;
        let buffer = self.create_buffer(
            data.len() as u64,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.copy_buffer(&staging, &buffer, data.len() as u64)?;
        Ok(buffer)
    }

    /// Upload tightly packed pixels into a new device-local image left in
    /// `GENERAL` layout.
    pub fn upload_image(&self, desc: ImageDesc, pixels: &[u8]) -> Result<Arc<GpuImage>> {
        let expected = image_byte_size(&desc);
        if pixels.len() as u64 != expected {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                end: pixels.len() as u64,
                size: expected,
            });
        }
        let staging = self.create_staging_buffer(pixels)?;
        let desc = ImageDesc {
            usage: desc.usage | vk::ImageUsageFlags::TRANSFER_DST,
            ..desc
        };
        let image = self.create_image(desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        self.transition_image_layout(
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.copy_buffer_to_image(&staging, &image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        self.transition_image_layout(
            &image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::GENERAL,
        )?;
        Ok(image)
    }

    /// Read back the whole `image`, which must be in `layout`.
    pub fn download_image(&self, image: &GpuImage, layout: vk::ImageLayout) -> Result<Vec<u8>> {
        let size = image_byte_size(&image.desc);
        let readback = self.create_host_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;
        self.copy_image_to_buffer(image, layout, &readback)?;
        let mut out = vec![0u8; size as usize];
        readback.read_bytes(0, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceRequirements, GpuContextBuilder};
    use crate::mock::{MockAdapter, MockInstance, ObjectKind};
    use crate::queue::Capability;

    const TABLE: [(vk::ImageLayout, vk::ImageLayout); 4] = [
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::GENERAL),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
        (vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
    ];

    fn context(mock: &Arc<MockInstance>) -> crate::GpuContext {
        GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Compute]))
            .instance(mock.clone())
            .build()
            .unwrap()
    }

    fn rgba_desc(size: u32) -> ImageDesc {
        ImageDesc {
            extent: vk::Extent2D {
                width: size,
                height: size,
            },
            format: vk::Format::R8G8B8A8_UNORM,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        }
    }

    #[test]
    fn table_transitions_are_supported() {
        for (old, new) in TABLE {
            assert!(layout_transition(old, new).is_ok(), "{old:?} -> {new:?}");
        }
        let t = layout_transition(vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        assert_eq!(t.src_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(t.dst_access, vk::AccessFlags2::TRANSFER_READ);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let layouts = [
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ];
        for old in layouts {
            for new in layouts {
                if TABLE.contains(&(old, new)) {
                    continue;
                }
                assert!(
                    matches!(
                        layout_transition(old, new),
                        Err(GpuError::UnsupportedLayoutTransition { .. })
                    ),
                    "{old:?} -> {new:?}"
                );
            }
        }
    }

    #[test]
    fn all_table_transitions_execute() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let image = allocator
            .create_image(rgba_desc(4), vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        allocator
            .transition_image_layout(&image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        allocator
            .transition_image_layout(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::GENERAL)
            .unwrap();
        allocator
            .transition_image_layout(&image, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        allocator
            .transition_image_layout(&image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
            .unwrap();
        assert_eq!(mock.image_layout(image.image), Some(vk::ImageLayout::GENERAL));
        assert!(mock.ledger().violations().is_empty());
    }

    #[test]
    fn unsupported_transition_records_nothing() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let image = allocator
            .create_image(rgba_desc(4), vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let err = allocator
            .transition_image_layout(&image, vk::ImageLayout::GENERAL, vk::ImageLayout::UNDEFINED)
            .unwrap_err();
        assert!(matches!(err, GpuError::UnsupportedLayoutTransition { .. }));
        assert_eq!(mock.ledger().created_count(ObjectKind::CommandBuffer), 0);
    }

    #[test]
    fn upload_buffer_through_staging() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let data: Vec<u8> = (0..64).collect();
        let buffer = allocator
            .upload_buffer(&data, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        assert!(!buffer.is_host_visible());
        assert_eq!(mock.memory_bytes(buffer.memory, 64), Some(data));
        // The staging buffer is gone once the upload returns.
        assert_eq!(mock.ledger().live_count(ObjectKind::Buffer), 1);
    }

    #[test]
    fn image_upload_download_round_trip() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let pixels: Vec<u8> = (0..64).map(|i| i as u8 * 3).collect();
        let image = allocator.upload_image(rgba_desc(4), &pixels).unwrap();
        assert_eq!(mock.image_layout(image.image), Some(vk::ImageLayout::GENERAL));
        allocator
            .transition_image_layout(&image, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        let out = allocator
            .download_image(&image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap();
        assert_eq!(out, pixels);
        assert!(mock.ledger().violations().is_empty());
    }

    #[test]
    fn copy_from_wrong_layout_is_flagged() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        let image = allocator
            .create_image(rgba_desc(2), vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        // Still UNDEFINED, never transitioned.
        let _ = allocator.download_image(&image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(mock.ledger().violations().len(), 1);
    }

    #[test]
    fn upload_image_rejects_wrong_pixel_count() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        assert!(matches!(
            allocator.upload_image(rgba_desc(4), &[0; 10]),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn empty_upload_is_rejected() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let allocator = ctx.allocator().unwrap();
        assert!(matches!(
            allocator.create_staging_buffer(&[]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            allocator.upload_buffer(&[], vk::BufferUsageFlags::STORAGE_BUFFER),
            Err(GpuError::InvalidState(_))
        ));
        let ledger = mock.ledger();
        assert_eq!(ledger.created_count(ObjectKind::Buffer), 0);
        assert!(ledger.violations().is_empty());
    }
}
