//! CPU stand-ins for compute shaders.

use super::device::DeviceState;
use crate::api::DescriptorResource;
use ash::vk::{self, Handle};
use std::sync::Arc;

/// Result type of a mock kernel; the error is recorded as a violation.
pub type KernelResult<T> = std::result::Result<T, String>;

/// A registered kernel body.
pub(crate) type Kernel = Arc<dyn Fn(&mut KernelIo<'_>) -> KernelResult<()> + Send + Sync>;

/// Access to the resources bound for one dispatch.
pub struct KernelIo<'a> {
    pub(super) state: &'a mut DeviceState,
    pub(super) set: Option<u64>,
    pub(super) groups: [u32; 3],
    pub(super) push_constants: &'a [u8],
}

impl KernelIo<'_> {
    /// Workgroup counts of the dispatch.
    pub const fn groups(&self) -> [u32; 3] {
        self.groups
    }

    /// Push constant bytes recorded before the dispatch.
    pub fn push_constants(&self) -> &[u8] {
        self.push_constants
    }

    fn resource(&self, binding: u32) -> KernelResult<DescriptorResource> {
        let set = self.set.ok_or("no descriptor set bound")?;
        self.state.descriptor(set, binding)
    }

    /// Bytes of the buffer range written into `binding`.
    pub fn read_buffer(&self, binding: u32) -> KernelResult<Vec<u8>> {
        match self.resource(binding)? {
            DescriptorResource::UniformBuffer {
                buffer,
                offset,
                range,
            }
            | DescriptorResource::StorageBuffer {
                buffer,
                offset,
                range,
            } => self.state.read_buffer(buffer.as_raw(), offset, range),
            other => Err(format!("binding {binding} is {:?}, not a buffer", other.kind())),
        }
    }

    /// Overwrite the start of the storage buffer range in `binding`.
    pub fn write_buffer(&mut self, binding: u32, data: &[u8]) -> KernelResult<()> {
        match self.resource(binding)? {
            DescriptorResource::StorageBuffer {
                buffer,
                offset,
                range,
            } => {
                if data.len() as u64 > range {
                    return Err(format!(
                        "write of {} bytes exceeds binding {binding} range {range}",
                        data.len()
                    ));
                }
                self.state.write_buffer(buffer.as_raw(), offset, data)
            }
            other => Err(format!(
                "binding {binding} is {:?}, not a storage buffer",
                other.kind()
            )),
        }
    }

    fn image_binding(&self, binding: u32) -> KernelResult<(u64, vk::ImageLayout)> {
        match self.resource(binding)? {
            DescriptorResource::StorageImage { view, layout }
            | DescriptorResource::CombinedImageSampler { view, layout, .. } => {
                Ok((self.state.view_image(view.as_raw())?, layout))
            }
            other => Err(format!("binding {binding} is {:?}, not an image", other.kind())),
        }
    }

    /// Extent of the image bound at `binding`.
    pub fn image_extent(&self, binding: u32) -> KernelResult<vk::Extent2D> {
        let (image, _) = self.image_binding(binding)?;
        Ok(self.state.image_desc(image)?.extent)
    }

    /// Tightly packed texels of the image bound at `binding`.
    pub fn read_image(&self, binding: u32) -> KernelResult<Vec<u8>> {
        let (image, layout) = self.image_binding(binding)?;
        self.state.read_image(image, layout)
    }

    /// Replace the texels of the image bound at `binding`.
    pub fn write_image(&mut self, binding: u32, data: &[u8]) -> KernelResult<()> {
        let (image, layout) = self.image_binding(binding)?;
        self.state.write_image(image, layout, data)
    }
}
