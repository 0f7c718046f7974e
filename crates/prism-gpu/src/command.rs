//! Command buffer management.

use crate::api::{ClearValue, Command, ImageBarrier};
use crate::context::Device;
use crate::descriptors::DescriptorSet;
use crate::error::Result;
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::{ComputePipeline, Framebuffer, GraphicsPipeline, RenderPass};
use crate::queue::Queue;
use ash::vk;
use std::sync::Arc;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
    device: Arc<Device>,
}

impl CommandPool {
    /// Create a new command pool.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool = device.api().create_command_pool(queue_family, flags)?;
        Ok(Self {
            pool,
            queue_family,
            device: device.clone(),
        })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Owning device.
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate a primary command buffer and begin recording into it.
    pub fn begin(self: &Arc<Self>, one_time: bool) -> Result<RecordingCommandBuffer> {
        let api = self.device.api();
        let handle = api.allocate_command_buffer(self.pool)?;
        let buffer = CommandBuffer {
            handle,
            pool: self.clone(),
        };
        api.begin_command_buffer(handle, one_time)?;
        Ok(RecordingCommandBuffer { buffer })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::trace!("Destroying command pool for family {}", self.queue_family);
        self.device.api().destroy_command_pool(self.pool);
    }
}

/// A command buffer returned to its pool on drop.
struct CommandBuffer {
    handle: vk::CommandBuffer,
    pool: Arc<CommandPool>,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.pool
            .device
            .api()
            .free_command_buffer(self.pool.pool, self.handle);
    }
}

/// A command buffer in the recording state.
pub struct RecordingCommandBuffer {
    buffer: CommandBuffer,
}

impl RecordingCommandBuffer {
    /// Raw handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer.handle
    }

    /// Record a command.
    pub fn record(&mut self, command: &Command) -> &mut Self {
        self.buffer
            .pool
            .device
            .api()
            .record(self.buffer.handle, command);
        self
    }

    /// Record an image layout barrier.
    pub fn image_barrier(&mut self, barrier: ImageBarrier) -> &mut Self {
        self.record(&Command::ImageBarrier(barrier))
    }

    /// Record a buffer to buffer copy of `size` bytes.
    pub fn copy_buffer(&mut self, src: &GpuBuffer, dst: &GpuBuffer, size: u64) -> &mut Self {
        self.record(&Command::CopyBuffer {
            src: src.buffer,
            dst: dst.buffer,
            size,
        })
    }

    /// Record a full-extent buffer to image copy.
    pub fn copy_buffer_to_image(
        &mut self,
        buffer: &GpuBuffer,
        image: &GpuImage,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.record(&Command::CopyBufferToImage {
            buffer: buffer.buffer,
            image: image.image,
            layout,
            aspect: image.aspect(),
            extent: image.extent(),
        })
    }

    /// Record a full-extent image to buffer copy.
    pub fn copy_image_to_buffer(
        &mut self,
        image: &GpuImage,
        layout: vk::ImageLayout,
        buffer: &GpuBuffer,
    ) -> &mut Self {
        self.record(&Command::CopyImageToBuffer {
            image: image.image,
            layout,
            aspect: image.aspect(),
            buffer: buffer.buffer,
            extent: image.extent(),
        })
    }

    /// Bind a compute pipeline and its descriptor set.
    pub fn bind_compute(&mut self, pipeline: &ComputePipeline, set: &DescriptorSet) -> &mut Self {
        self.record(&Command::BindPipeline {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            pipeline: pipeline.pipeline,
        });
        self.record(&Command::BindDescriptorSet {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout: pipeline.layout,
            set: set.handle(),
        })
    }

    /// Push constants to the given pipeline layout.
    pub fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) -> &mut Self {
        self.record(&Command::PushConstants {
            layout,
            stages,
            offset: 0,
            data: data.to_vec(),
        })
    }

    /// Dispatch compute workgroups.
    pub fn dispatch(&mut self, groups: [u32; 3]) -> &mut Self {
        self.record(&Command::Dispatch { groups })
    }

    /// End recording.
    pub fn finish(self) -> Result<ExecutableCommandBuffer> {
        self.buffer
            .pool
            .device
            .api()
            .end_command_buffer(self.buffer.handle)?;
        Ok(ExecutableCommandBuffer {
            buffer: self.buffer,
        })
    }
}

/// A fully recorded command buffer ready for submission.
pub struct ExecutableCommandBuffer {
    buffer: CommandBuffer,
}

impl ExecutableCommandBuffer {
    /// Raw handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer.handle
    }

    /// Queue family of the pool this buffer came from.
    pub fn queue_family(&self) -> u32 {
        self.buffer.pool.queue_family
    }
}

/// Record, submit and wait for a single-use command buffer.
///
/// `queue` must belong to the pool's family. The command buffer is freed on
/// every path, including recording and submission failures; if the queue
/// wait fails the device is idled first.
pub fn execute_single_time_commands<F>(pool: &Arc<CommandPool>, queue: Queue, f: F) -> Result<()>
where
    F: FnOnce(&mut RecordingCommandBuffer) -> Result<()>,
{
    queue.check_family(pool.queue_family)?;
    let mut recording = pool.begin(true)?;
    f(&mut recording)?;
    let cmd = recording.finish()?;

    let api = pool.device.api();
    api.queue_submit(queue.handle, &[cmd.handle()], vk::Fence::null())?;
    if let Err(e) = api.queue_wait_idle(queue.handle) {
        tracing::error!("Queue wait failed: {}", e);
        if let Err(idle) = pool.device.wait_idle() {
            tracing::warn!("Device wait idle after failed queue wait failed: {}", idle);
        }
        return Err(e);
    }

    Ok(())
}

/// Record a single compute dispatch.
pub fn record_dispatch(
    pool: &Arc<CommandPool>,
    pipeline: &ComputePipeline,
    set: &DescriptorSet,
    groups: [u32; 3],
    push_constants: Option<&[u8]>,
) -> Result<ExecutableCommandBuffer> {
    let mut cmd = pool.begin(true)?;
    cmd.bind_compute(pipeline, set);
    if let Some(data) = push_constants {
        cmd.push_constants(pipeline.layout, vk::ShaderStageFlags::COMPUTE, data);
    }
    cmd.dispatch(groups);
    cmd.finish()
}

/// Everything needed to record one indexed draw into a render pass.
pub struct DrawCall<'a> {
    /// Render pass to begin
    pub render_pass: &'a RenderPass,
    /// Target framebuffer
    pub framebuffer: &'a Framebuffer,
    /// Graphics pipeline
    pub pipeline: &'a GraphicsPipeline,
    /// Descriptor set bound at set 0, if any
    pub descriptor_set: Option<&'a DescriptorSet>,
    /// Push constants for all graphics stages, if any
    pub push_constants: Option<&'a [u8]>,
    /// Vertex buffer bound at binding 0
    pub vertex_buffer: &'a GpuBuffer,
    /// 32-bit index buffer
    pub index_buffer: &'a GpuBuffer,
    /// Number of indices to draw
    pub index_count: u32,
    /// Clear values, one per attachment
    pub clear_values: Vec<ClearValue>,
}

/// Record a render pass with a single indexed draw.
pub fn record_draw(pool: &Arc<CommandPool>, draw: &DrawCall<'_>) -> Result<ExecutableCommandBuffer> {
    let mut cmd = pool.begin(true)?;
    cmd.record(&Command::BeginRenderPass {
        render_pass: draw.render_pass.handle(),
        framebuffer: draw.framebuffer.handle(),
        extent: draw.framebuffer.extent(),
        clear_values: draw.clear_values.clone(),
    });
    cmd.record(&Command::BindPipeline {
        bind_point: vk::PipelineBindPoint::GRAPHICS,
        pipeline: draw.pipeline.pipeline,
    });
    if let Some(set) = draw.descriptor_set {
        cmd.record(&Command::BindDescriptorSet {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout: draw.pipeline.layout,
            set: set.handle(),
        });
    }
    if let Some(data) = draw.push_constants {
        cmd.push_constants(draw.pipeline.layout, vk::ShaderStageFlags::ALL_GRAPHICS, data);
    }
    cmd.record(&Command::BindVertexBuffer {
        buffer: draw.vertex_buffer.buffer,
        offset: 0,
    });
    cmd.record(&Command::BindIndexBuffer {
        buffer: draw.index_buffer.buffer,
        offset: 0,
        index_type: vk::IndexType::UINT32,
    });
    cmd.record(&Command::DrawIndexed {
        index_count: draw.index_count,
        instance_count: 1,
        first_index: 0,
        vertex_offset: 0,
        first_instance: 0,
    });
    cmd.record(&Command::EndRenderPass);
    cmd.finish()
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
    fn single_time_commands_free_buffer() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        execute_single_time_commands(ctx.command_pool(), ctx.primary_queue().unwrap(), |_| Ok(()))
            .unwrap();
        let ledger = mock.ledger();
        assert_eq!(ledger.created_count(ObjectKind::CommandBuffer), 1);
        assert_eq!(ledger.live_count(ObjectKind::CommandBuffer), 0);
        assert_eq!(mock.stats().submits, 1);
    }

    #[test]
    fn single_time_commands_free_buffer_on_error() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        let result = execute_single_time_commands(ctx.command_pool(), ctx.primary_queue().unwrap(), |_| {
            Err(crate::GpuError::InvalidState("recording failed".to_string()))
        });
        assert!(result.is_err());
        let ledger = mock.ledger();
        assert_eq!(ledger.live_count(ObjectKind::CommandBuffer), 0);
        assert_eq!(mock.stats().submits, 0);
    }

    #[test]
    fn failed_submit_still_frees_buffer() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        mock.fail_call("vkQueueSubmit");
        let err = execute_single_time_commands(ctx.command_pool(), ctx.primary_queue().unwrap(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, crate::GpuError::ApiCall { call: "vkQueueSubmit", .. }));
        assert_eq!(mock.ledger().live_count(ObjectKind::CommandBuffer), 0);
    }

    #[test]
    fn rejects_queue_of_another_family() {
        let mock = MockInstance::new(vec![MockAdapter::new("Split").queue_families(vec![
            (vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::GRAPHICS, 1),
        ])]);
        let ctx = GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Compute, Capability::Graphics]))
            .instance(mock.clone())
            .build()
            .unwrap();
        let graphics = ctx.queue(Capability::Graphics).unwrap();
        let err = execute_single_time_commands(ctx.command_pool(), graphics, |_| Ok(())).unwrap_err();
        assert!(matches!(err, crate::GpuError::InvalidState(_)));
        assert_eq!(mock.stats().submits, 0);
        assert_eq!(mock.ledger().created_count(ObjectKind::CommandBuffer), 0);
        assert!(mock.ledger().violations().is_empty());
    }

    #[test]
    fn failed_queue_wait_idles_device() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = context(&mock);
        mock.fail_call("vkQueueWaitIdle");
        let idles_before = mock.stats().device_idles;
        let err = execute_single_time_commands(ctx.command_pool(), ctx.primary_queue().unwrap(), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, crate::GpuError::ApiCall { call: "vkQueueWaitIdle", .. }));
        assert_eq!(mock.stats().device_idles, idles_before + 1);
        assert_eq!(mock.ledger().live_count(ObjectKind::CommandBuffer), 0);
        assert!(mock.ledger().violations().is_empty());
    }
}
