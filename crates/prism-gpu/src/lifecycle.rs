//! Ordered setup, execution and teardown of a GPU workload.

use crate::context::{DeviceRequirements, GpuContext, GpuContextBuilder};
use crate::error::GpuError;
use std::fmt;

/// A unit of GPU work driven by [`Lifecycle`].
///
/// Each phase method runs once, in declaration order. Implementations keep
/// their device objects in `Option` fields and drop them in
/// [`Workload::release`] in reverse creation order.
pub trait Workload {
    /// What [`Workload::export`] produces.
    type Output;
    /// Error type of the workload; GPU errors convert into it.
    type Error: From<GpuError> + fmt::Display;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Queue capabilities, features and extensions the workload needs.
    fn requirements(&self) -> DeviceRequirements;

    /// Allocate buffers and images and upload inputs.
    fn create_resources(&mut self, ctx: &GpuContext) -> Result<(), Self::Error>;

    /// Create descriptor layouts, pools and sets.
    fn build_descriptors(&mut self, ctx: &GpuContext) -> Result<(), Self::Error>;

    /// Create pipelines.
    fn build_pipeline(&mut self, ctx: &GpuContext) -> Result<(), Self::Error>;

    /// Record command buffers, submit them and wait for completion.
    fn record_and_submit(&mut self, ctx: &GpuContext) -> Result<(), Self::Error>;

    /// Read results back to the host.
    fn export(&mut self, ctx: &GpuContext) -> Result<Self::Output, Self::Error>;

    /// Drop every device object, newest first. Must be safe to call twice.
    fn release(&mut self);
}

/// A step of [`Lifecycle::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Instance, device selection and logical device
    Context,
    /// Buffers and images
    Resources,
    /// Descriptor layouts, pools and sets
    Descriptors,
    /// Pipelines
    Pipeline,
    /// Command recording and submission
    Submit,
    /// Readback
    Export,
}

/// Where a [`Lifecycle`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started
    Idle,
    /// Executing a stage
    Running(Stage),
    /// All stages finished
    Complete,
    /// A stage returned an error
    Failed(Stage),
    /// Everything has been released
    CleanedUp,
}

/// Runs a [`Workload`] and guarantees teardown on every exit path.
pub struct Lifecycle<W: Workload> {
    workload: W,
    builder: Option<GpuContextBuilder>,
    context: Option<GpuContext>,
    phase: Phase,
}

impl<W: Workload> Lifecycle<W> {
    /// Prepare a lifecycle; nothing is created until [`Lifecycle::run`].
    pub fn new(workload: W, builder: GpuContextBuilder) -> Self {
        Self {
            workload,
            builder: Some(builder),
            context: None,
            phase: Phase::Idle,
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The workload.
    pub const fn workload(&self) -> &W {
        &self.workload
    }

    /// The context, once created and until cleanup.
    pub const fn context(&self) -> Option<&GpuContext> {
        self.context.as_ref()
    }

    /// Create the context and run every workload phase in order.
    ///
    /// On error the phase is left at [`Phase::Failed`]; objects created so far
    /// stay alive until [`Lifecycle::cleanup`] or drop.
    pub fn run(&mut self) -> Result<W::Output, W::Error> {
        let Some(builder) = self.builder.take() else {
            return Err(GpuError::InvalidState("lifecycle already ran".to_string()).into());
        };

        let name = self.workload.name().to_string();
        tracing::info!("Running workload '{}'", name);

        self.phase = Phase::Running(Stage::Context);
        let ctx = match builder.requirements(self.workload.requirements()).build() {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.fail(Stage::Context, e.into())),
        };
        let ctx: &GpuContext = self.context.insert(ctx);
        let workload = &mut self.workload;

        let steps: [(Stage, fn(&mut W, &GpuContext) -> Result<(), W::Error>); 4] = [
            (Stage::Resources, W::create_resources),
            (Stage::Descriptors, W::build_descriptors),
            (Stage::Pipeline, W::build_pipeline),
            (Stage::Submit, W::record_and_submit),
        ];
        for (stage, step) in steps {
            self.phase = Phase::Running(stage);
            tracing::debug!("{}: {:?}", name, stage);
            if let Err(e) = step(workload, ctx) {
                self.phase = Phase::Failed(stage);
                tracing::error!("{} failed during {:?}: {}", name, stage, e);
                return Err(e);
            }
        }

        self.phase = Phase::Running(Stage::Export);
        match workload.export(ctx) {
            Ok(output) => {
                self.phase = Phase::Complete;
                tracing::info!("Workload '{}' complete", name);
                Ok(output)
            }
            Err(e) => {
                self.phase = Phase::Failed(Stage::Export);
                tracing::error!("{} failed during {:?}: {}", name, Stage::Export, e);
                Err(e)
            }
        }
    }

    fn fail(&mut self, stage: Stage, error: W::Error) -> W::Error {
        self.phase = Phase::Failed(stage);
        tracing::error!("{} failed during {:?}: {}", self.workload.name(), stage, error);
        error
    }

    /// Release workload objects, then the context. Idempotent.
    pub fn cleanup(&mut self) {
        if self.phase == Phase::CleanedUp {
            return;
        }
        self.workload.release();
        if let Some(ctx) = self.context.take() {
            if let Err(e) = ctx.wait_idle() {
                tracing::warn!("Wait idle before teardown failed: {}", e);
            }
            drop(ctx);
        }
        self.builder = None;
        self.phase = Phase::CleanedUp;
        tracing::debug!("Cleaned up '{}'", self.workload.name());
    }
}

impl<W: Workload> Drop for Lifecycle<W> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageDesc;
    use crate::command::record_dispatch;
    use crate::descriptors::{
        write_storage_buffer, DescriptorPool, DescriptorSet, DescriptorSetLayout,
        DescriptorSetLayoutBuilder,
    };
    use crate::memory::{GpuBuffer, GpuImage, ImageView};
    use crate::mock::{mock_spirv, MockAdapter, MockInstance, ObjectKind};
    use crate::pipeline::ComputePipeline;
    use crate::queue::Capability;
    use crate::sync::{submit_and_wait, DEFAULT_FENCE_TIMEOUT_NS};
    use ash::vk;
    use std::sync::Arc;

    /// Doubles every u32 of a host-visible storage buffer.
    struct DoubleWorkload {
        input: Vec<u32>,
        fail_at: Option<Stage>,
        buffer: Option<GpuBuffer>,
        scratch_view: Option<ImageView>,
        scratch: Option<Arc<GpuImage>>,
        set_layout: Option<DescriptorSetLayout>,
        pool: Option<Arc<DescriptorPool>>,
        set: Option<DescriptorSet>,
        pipeline: Option<ComputePipeline>,
    }

    impl DoubleWorkload {
        fn new(input: Vec<u32>, fail_at: Option<Stage>) -> Self {
            Self {
                input,
                fail_at,
                buffer: None,
                scratch_view: None,
                scratch: None,
                set_layout: None,
                pool: None,
                set: None,
                pipeline: None,
            }
        }

        fn check(&self, stage: Stage) -> Result<(), GpuError> {
            if self.fail_at == Some(stage) {
                return Err(GpuError::InvalidState(format!("injected failure in {stage:?}")));
            }
            Ok(())
        }

        fn missing(what: &str) -> GpuError {
            GpuError::ResourceNotFound(what.to_string())
        }
    }

    impl Workload for DoubleWorkload {
        type Output = Vec<u32>;
        type Error = GpuError;

        fn name(&self) -> &str {
            "double"
        }

        fn requirements(&self) -> DeviceRequirements {
            DeviceRequirements::new([Capability::Compute])
        }

        fn create_resources(&mut self, ctx: &GpuContext) -> Result<(), GpuError> {
            let allocator = ctx.allocator()?;
            let buffer = allocator.create_host_buffer(
                (self.input.len() * 4) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            )?;
            buffer.write(&self.input)?;
            self.buffer = Some(buffer);
            let scratch = allocator.create_image(
                ImageDesc {
                    extent: vk::Extent2D {
                        width: 2,
                        height: 2,
                    },
                    format: vk::Format::R8G8B8A8_UNORM,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::STORAGE,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            self.scratch_view = Some(allocator.create_image_view(&scratch, vk::ImageAspectFlags::COLOR)?);
            self.scratch = Some(scratch);
            self.check(Stage::Resources)
        }

        fn build_descriptors(&mut self, ctx: &GpuContext) -> Result<(), GpuError> {
            let layout = DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .build(ctx.device())?;
            let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout])?;
            let set = pool.allocate(&layout)?;
            let buffer = self.buffer.as_ref().ok_or_else(|| Self::missing("buffer"))?;
            set.write(&[write_storage_buffer(0, buffer)])?;
            self.set_layout = Some(layout);
            self.pool = Some(pool);
            self.set = Some(set);
            self.check(Stage::Descriptors)
        }

        fn build_pipeline(&mut self, ctx: &GpuContext) -> Result<(), GpuError> {
            let layout = self.set_layout.as_ref().ok_or_else(|| Self::missing("layout"))?;
            self.pipeline = Some(ComputePipeline::new(ctx.device(), &mock_spirv(42), layout, &[])?);
            self.check(Stage::Pipeline)
        }

        fn record_and_submit(&mut self, ctx: &GpuContext) -> Result<(), GpuError> {
            let pipeline = self.pipeline.as_ref().ok_or_else(|| Self::missing("pipeline"))?;
            let set = self.set.as_ref().ok_or_else(|| Self::missing("set"))?;
            let cmd = record_dispatch(ctx.command_pool(), pipeline, set, [1, 1, 1], None)?;
            submit_and_wait(ctx.device(), ctx.primary_queue()?, &cmd, DEFAULT_FENCE_TIMEOUT_NS)?;
            self.check(Stage::Submit)
        }

        fn export(&mut self, _ctx: &GpuContext) -> Result<Vec<u32>, GpuError> {
            self.check(Stage::Export)?;
            let buffer = self.buffer.as_ref().ok_or_else(|| Self::missing("buffer"))?;
            buffer.read(self.input.len())
        }

        fn release(&mut self) {
            self.pipeline = None;
            self.set = None;
            self.pool = None;
            self.set_layout = None;
            self.scratch_view = None;
            self.scratch = None;
            self.buffer = None;
        }
    }

    fn mock_with_double_kernel() -> Arc<MockInstance> {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        mock.register_kernel(&mock_spirv(42), |io| {
            let doubled: Vec<u8> = io
                .read_buffer(0)?
                .chunks_exact(4)
                .flat_map(|c| (u32::from_le_bytes([c[0], c[1], c[2], c[3]]) * 2).to_le_bytes())
                .collect();
            io.write_buffer(0, &doubled)
        });
        mock
    }

    fn builder(mock: &Arc<MockInstance>) -> GpuContextBuilder {
        GpuContextBuilder::new().instance(mock.clone())
    }

    #[test]
    fn run_then_cleanup_leaves_nothing_alive() {
        let mock = mock_with_double_kernel();
        let mut lifecycle = Lifecycle::new(DoubleWorkload::new(vec![1, 2, 3], None), builder(&mock));
        let output = lifecycle.run().unwrap();
        assert_eq!(output, vec![2, 4, 6]);
        assert_eq!(lifecycle.phase(), Phase::Complete);

        lifecycle.cleanup();
        lifecycle.cleanup();
        assert_eq!(lifecycle.phase(), Phase::CleanedUp);

        let ledger = mock.ledger();
        assert!(ledger.violations().is_empty(), "{:?}", ledger.violations());
        assert!(ledger.live_objects().is_empty(), "{:?}", ledger.live_objects());
    }

    #[test]
    fn teardown_follows_reverse_creation_order() {
        let mock = mock_with_double_kernel();
        {
            let mut lifecycle =
                Lifecycle::new(DoubleWorkload::new(vec![5], None), builder(&mock));
            lifecycle.run().unwrap();
        }
        let order: Vec<ObjectKind> = mock
            .ledger()
            .destroy_order()
            .into_iter()
            .filter(|kind| {
                !matches!(
                    kind,
                    ObjectKind::CommandBuffer | ObjectKind::Fence | ObjectKind::ShaderModule
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ObjectKind::Pipeline,
                ObjectKind::PipelineLayout,
                ObjectKind::DescriptorPool,
                ObjectKind::DescriptorSetLayout,
                ObjectKind::ImageView,
                ObjectKind::Image,
                ObjectKind::Memory,
                ObjectKind::Buffer,
                ObjectKind::Memory,
                ObjectKind::CommandPool,
                ObjectKind::Device,
                ObjectKind::Instance,
            ]
        );
    }

    #[test]
    fn failure_in_any_stage_still_tears_down_cleanly() {
        for stage in [
            Stage::Resources,
            Stage::Descriptors,
            Stage::Pipeline,
            Stage::Submit,
            Stage::Export,
        ] {
            let mock = mock_with_double_kernel();
            {
                let mut lifecycle =
                    Lifecycle::new(DoubleWorkload::new(vec![1], Some(stage)), builder(&mock));
                assert!(lifecycle.run().is_err());
                assert_eq!(lifecycle.phase(), Phase::Failed(stage));
            }
            let ledger = mock.ledger();
            assert!(ledger.violations().is_empty(), "{stage:?}: {:?}", ledger.violations());
            assert!(ledger.live_objects().is_empty(), "{stage:?}: {:?}", ledger.live_objects());
        }
    }

    #[test]
    fn context_failure_is_reported() {
        let mock = MockInstance::new(vec![MockAdapter::new("Transfer only")
            .queue_families(vec![(vk::QueueFlags::TRANSFER, 1)])]);
        let mut lifecycle = Lifecycle::new(DoubleWorkload::new(vec![1], None), builder(&mock));
        assert!(matches!(lifecycle.run(), Err(GpuError::NoSuitableDevice)));
        assert_eq!(lifecycle.phase(), Phase::Failed(Stage::Context));
        drop(lifecycle);
        assert!(mock.ledger().live_objects().is_empty());
    }

    #[test]
    fn second_run_is_rejected() {
        let mock = mock_with_double_kernel();
        let mut lifecycle = Lifecycle::new(DoubleWorkload::new(vec![1], None), builder(&mock));
        lifecycle.run().unwrap();
        assert!(matches!(lifecycle.run(), Err(GpuError::InvalidState(_))));
    }
}
