//! Compute pass that writes an output image from a sampled input image.
//!
//! Binding 0 is the input as a combined image sampler, binding 1 the output
//! storage image. Both stay in `GENERAL` layout while the shader runs; the
//! output is moved to `TRANSFER_SRC_OPTIMAL` for readback.

use crate::error::{RenderError, Result};
use crate::require;
use ash::vk;
use prism_core::constants::IMAGE_WORKGROUP_SIZE;
use prism_core::{dispatch_size, RgbaImage};
use prism_gpu::descriptors::{write_sampled_image, write_storage_image};
use prism_gpu::sync::{submit_and_wait, DEFAULT_FENCE_TIMEOUT_NS};
use prism_gpu::{
    record_dispatch, Capability, ComputePipeline, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DeviceFeature, DeviceRequirements, GpuContext, GpuImage, ImageDesc,
    ImageView, Sampler, SamplerDesc, Workload,
};
use std::sync::Arc;
use tracing::info;

const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Upper bound on the requested sampler anisotropy.
pub const MAX_ANISOTROPY: f32 = 16.0;

/// Runs one compute shader over an RGBA8 image.
pub struct ImagePass {
    input: RgbaImage,
    shader: Vec<u32>,

    input_image: Option<Arc<GpuImage>>,
    input_view: Option<ImageView>,
    sampler: Option<Sampler>,
    output_image: Option<Arc<GpuImage>>,
    output_view: Option<ImageView>,

    set_layout: Option<DescriptorSetLayout>,
    pool: Option<Arc<DescriptorPool>>,
    set: Option<DescriptorSet>,
    pipeline: Option<ComputePipeline>,
}

impl ImagePass {
    /// Create a pass over `input` running the SPIR-V in `shader`.
    pub const fn new(input: RgbaImage, shader: Vec<u32>) -> Self {
        Self {
            input,
            shader,
            input_image: None,
            input_view: None,
            sampler: None,
            output_image: None,
            output_view: None,
            set_layout: None,
            pool: None,
            set: None,
            pipeline: None,
        }
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.input.width(),
            height: self.input.height(),
        }
    }

    /// Workgroup counts covering the image.
    pub fn groups(&self) -> [u32; 3] {
        dispatch_size(self.input.width(), self.input.height(), IMAGE_WORKGROUP_SIZE)
    }
}

impl Workload for ImagePass {
    type Output = RgbaImage;
    type Error = RenderError;

    fn name(&self) -> &str {
        "image"
    }

    fn requirements(&self) -> DeviceRequirements {
        DeviceRequirements::new([Capability::Compute]).feature(DeviceFeature::SamplerAnisotropy)
    }

    fn create_resources(&mut self, ctx: &GpuContext) -> Result<()> {
        let allocator = ctx.allocator()?;
        let extent = self.extent();

        let input_image = allocator.upload_image(
            ImageDesc {
                extent,
                format: FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::SAMPLED,
            },
            self.input.pixels(),
        )?;
        self.input_view = Some(allocator.create_image_view(&input_image, vk::ImageAspectFlags::COLOR)?);
        self.input_image = Some(input_image);

        let anisotropy = ctx
            .capabilities()
            .max_sampler_anisotropy
            .clamp(1.0, MAX_ANISOTROPY);
        self.sampler = Some(allocator.create_sampler(&SamplerDesc {
            max_anisotropy: Some(anisotropy),
            ..SamplerDesc::default()
        })?);

        let output_image = allocator.create_image(
            ImageDesc {
                extent,
                format: FORMAT,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        allocator.transition_image_layout(
            &output_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        )?;
        self.output_view = Some(allocator.create_image_view(&output_image, vk::ImageAspectFlags::COLOR)?);
        self.output_image = Some(output_image);
        Ok(())
    }

    fn build_descriptors(&mut self, ctx: &GpuContext) -> Result<()> {
        let layout = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
            .storage_image(1, vk::ShaderStageFlags::COMPUTE)
            .build(ctx.device())?;
        let pool = DescriptorPool::for_layouts(ctx.device(), &[&layout])?;
        let set = pool.allocate(&layout)?;
        set.write(&[
            write_sampled_image(
                0,
                require(&self.input_view, "input view")?,
                require(&self.sampler, "sampler")?,
                vk::ImageLayout::GENERAL,
            ),
            write_storage_image(1, require(&self.output_view, "output view")?),
        ])?;
        self.set_layout = Some(layout);
        self.pool = Some(pool);
        self.set = Some(set);
        Ok(())
    }

    fn build_pipeline(&mut self, ctx: &GpuContext) -> Result<()> {
        let layout = require(&self.set_layout, "descriptor set layout")?;
        self.pipeline = Some(ComputePipeline::new(ctx.device(), &self.shader, layout, &[])?);
        Ok(())
    }

    fn record_and_submit(&mut self, ctx: &GpuContext) -> Result<()> {
        let pipeline = require(&self.pipeline, "pipeline")?;
        let set = require(&self.set, "descriptor set")?;
        let groups = self.groups();
        let cmd = record_dispatch(ctx.command_pool(), pipeline, set, groups, None)?;
        submit_and_wait(ctx.device(), ctx.primary_queue()?, &cmd, DEFAULT_FENCE_TIMEOUT_NS)?;
        info!("Dispatched {:?} workgroups over {}x{}", groups, self.input.width(), self.input.height());
        Ok(())
    }

    fn export(&mut self, ctx: &GpuContext) -> Result<RgbaImage> {
        let allocator = ctx.allocator()?;
        let output = require(&self.output_image, "output image")?;
        allocator.transition_image_layout(
            output,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;
        let pixels = allocator.download_image(output, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        Ok(RgbaImage::new(self.input.width(), self.input.height(), pixels)?)
    }

    fn release(&mut self) {
        self.pipeline = None;
        self.set = None;
        self.pool = None;
        self.set_layout = None;
        self.output_view = None;
        self.output_image = None;
        self.sampler = None;
        self.input_view = None;
        self.input_image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::mock::{mock_spirv, MockAdapter, MockInstance};
    use prism_gpu::{GpuContextBuilder, Lifecycle, Phase};

    const INVERT: u32 = 7;

    fn mock() -> Arc<MockInstance> {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        mock.register_kernel(&mock_spirv(INVERT), |io| {
            let inverted: Vec<u8> = io
                .read_image(0)?
                .chunks_exact(4)
                .flat_map(|p| [255 - p[0], 255 - p[1], 255 - p[2], p[3]])
                .collect();
            io.write_image(1, &inverted)
        });
        mock
    }

    #[test]
    fn output_is_written_by_the_kernel() {
        let mock = mock();
        let input = RgbaImage::filled(5, 3, [10, 20, 30, 255]).unwrap();
        let mut lifecycle = Lifecycle::new(
            ImagePass::new(input, mock_spirv(INVERT)),
            GpuContextBuilder::new().instance(mock.clone()),
        );
        let output = lifecycle.run().unwrap();
        assert_eq!(output.width(), 5);
        assert_eq!(output.pixel(4, 2), Some([245, 235, 225, 255]));

        lifecycle.cleanup();
        let ledger = mock.ledger();
        assert!(ledger.violations().is_empty(), "{:?}", ledger.violations());
        assert!(ledger.live_objects().is_empty());
    }

    #[test]
    fn requires_anisotropy() {
        let mock = MockInstance::new(vec![
            MockAdapter::new("No aniso").features(vk::PhysicalDeviceFeatures::default())
        ]);
        let input = RgbaImage::filled(1, 1, [0; 4]).unwrap();
        let mut lifecycle = Lifecycle::new(
            ImagePass::new(input, mock_spirv(INVERT)),
            GpuContextBuilder::new().instance(mock.clone()),
        );
        let err = lifecycle.run().unwrap_err();
        assert!(matches!(err, RenderError::Gpu(prism_gpu::GpuError::NoSuitableDevice)));
        assert_eq!(lifecycle.phase(), Phase::Failed(prism_gpu::lifecycle::Stage::Context));
    }

    #[test]
    fn groups_cover_the_image() {
        let pass = ImagePass::new(RgbaImage::filled(33, 16, [0; 4]).unwrap(), Vec::new());
        assert_eq!(pass.groups(), [3, 1, 1]);
    }
}
