//! Headless workload runs on the mock GPU.
//!
//! [`MockHarness`] wraps a [`MockInstance`] with the demo kernels registered
//! and runs workloads through a [`Lifecycle`], recording what was destroyed
//! during teardown.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use prism_app::AppConfig;
use prism_gpu::lifecycle::Stage;
use prism_gpu::mock::{LedgerEvent, LedgerSnapshot, MockAdapter, MockInstance, ObjectKind};
use prism_gpu::{GpuContextBuilder, Lifecycle, Phase, Workload};

use crate::kernels;

/// A mock GPU with the demo kernels registered.
pub struct MockHarness {
    mock: Arc<MockInstance>,
}

impl MockHarness {
    /// Harness over the given adapters.
    pub fn new(adapters: Vec<MockAdapter>) -> Self {
        let mock = MockInstance::new(adapters);
        kernels::register_all(&mock);
        Self { mock }
    }

    /// One universal queue family with every feature the demos use.
    pub fn single_queue() -> Self {
        Self::new(vec![MockAdapter::new("Mock universal GPU")])
    }

    /// Graphics, compute and transfer on separate families.
    pub fn split_queues() -> Self {
        Self::new(vec![MockAdapter::new("Mock split GPU").queue_families(vec![
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
            (vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::TRANSFER, 1),
        ])])
    }

    /// A GPU without sampler anisotropy.
    pub fn without_anisotropy() -> Self {
        Self::new(vec![MockAdapter::new("Mock GPU without anisotropy").features(
            vk::PhysicalDeviceFeatures {
                tessellation_shader: vk::TRUE,
                ..Default::default()
            },
        )])
    }

    /// A GPU without tessellation shaders.
    pub fn without_tessellation() -> Self {
        Self::new(vec![MockAdapter::new("Mock GPU without tessellation").features(
            vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
        )])
    }

    /// The underlying mock instance.
    pub const fn mock(&self) -> &Arc<MockInstance> {
        &self.mock
    }

    /// Context builder running on the mock.
    pub fn context_builder(&self) -> GpuContextBuilder {
        GpuContextBuilder::new()
            .app_name("prism-test")
            .instance(self.mock.clone())
    }

    /// Application config running on the mock and writing to `output_dir`.
    pub fn app_config(&self, output_dir: impl AsRef<Path>) -> AppConfig {
        AppConfig::new("prism-test")
            .with_validation(false)
            .with_output_dir(output_dir.as_ref())
            .with_instance(self.mock.clone())
    }

    /// Run `workload` to completion or failure, then clean up.
    pub fn run<W: Workload>(&self, workload: W) -> RunReport<W::Output, W::Error> {
        let mut lifecycle = Lifecycle::new(workload, self.context_builder());
        let result = lifecycle.run();
        let phase = lifecycle.phase();

        let teardown_start = self.mock.ledger().events().len();
        lifecycle.cleanup();
        let ledger = self.mock.ledger();
        let teardown = ledger.events()[teardown_start..]
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::Destroyed(kind, _) => Some(*kind),
                LedgerEvent::Created(..) => None,
            })
            .collect();
        tracing::debug!("Run ended in {:?}", phase);

        RunReport {
            result,
            phase,
            teardown,
            ledger,
        }
    }
}

/// Outcome of [`MockHarness::run`].
pub struct RunReport<T, E> {
    /// What the lifecycle returned
    pub result: Result<T, E>,
    /// Phase reached before cleanup
    pub phase: Phase,
    /// Kinds destroyed during cleanup, in order
    pub teardown: Vec<ObjectKind>,
    /// Ledger after cleanup
    pub ledger: LedgerSnapshot,
}

impl<T, E> RunReport<T, E> {
    /// Stage the run failed in, if it failed.
    pub const fn failed_stage(&self) -> Option<Stage> {
        match self.phase {
            Phase::Failed(stage) => Some(stage),
            _ => None,
        }
    }

    /// Teardown sequence, one kind per line.
    pub fn teardown_text(&self) -> String {
        format_teardown(&self.teardown)
    }

    /// Panic unless cleanup left no live objects and no violations.
    pub fn assert_clean(&self) {
        assert!(
            self.ledger.violations().is_empty(),
            "violations: {:#?}",
            self.ledger.violations()
        );
        assert!(
            self.ledger.live_objects().is_empty(),
            "live objects: {:?}",
            self.ledger.live_objects()
        );
    }
}

/// One object kind per line.
pub fn format_teardown(kinds: &[ObjectKind]) -> String {
    kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::compare_images;
    use crate::kernels::{copy_shader, particle_shader};
    use prism_core::{Mesh, Particle, RgbaImage};
    use prism_gpu::mock::mock_spirv;
    use prism_gpu::{ErrorKind, GpuError};
    use prism_render::{ImagePass, Light, ParticlePass, RenderError, ShadowPass, ShadowShaders};

    fn mock_shadow_shaders() -> ShadowShaders {
        ShadowShaders {
            vertex: mock_spirv(1),
            control: mock_spirv(2),
            evaluation: mock_spirv(3),
            fragment: mock_spirv(4),
        }
    }

    fn gpu_kind(error: &RenderError) -> Option<ErrorKind> {
        match error {
            RenderError::Gpu(e) => Some(e.kind()),
            _ => None,
        }
    }

    #[test]
    fn white_image_copies_unchanged() {
        let harness = MockHarness::single_queue();
        let input = RgbaImage::filled(4, 4, [255; 4]).unwrap();

        let report = harness.run(ImagePass::new(input.clone(), copy_shader()));
        let output = report.result.as_ref().unwrap();

        assert_eq!((output.width(), output.height()), (4, 4));
        assert!(output.pixels().iter().all(|&b| b == 255));
        assert_eq!(output, &input);
        assert!(compare_images(&input, output).unwrap() < f64::EPSILON);
        assert_eq!(report.phase, Phase::Complete);
        assert_eq!(harness.mock().stats().dispatches, 1);
        report.assert_clean();
    }

    #[test]
    fn image_pass_teardown_order() {
        let harness = MockHarness::single_queue();
        let input = RgbaImage::filled(8, 8, [1, 2, 3, 4]).unwrap();

        let report = harness.run(ImagePass::new(input, copy_shader()));
        assert!(report.result.is_ok());
        report.assert_clean();
        insta::assert_snapshot!(report.teardown_text(), @r"
        Pipeline
        PipelineLayout
        DescriptorPool
        DescriptorSetLayout
        ImageView
        Image
        Memory
        Sampler
        ImageView
        Image
        Memory
        CommandPool
        Device
        Instance
        ");
    }

    #[test]
    fn pipeline_failure_still_tears_down() {
        let harness = MockHarness::single_queue();
        harness.mock().fail_call("vkCreateComputePipelines");
        let input = RgbaImage::filled(4, 4, [255; 4]).unwrap();

        let report = harness.run(ImagePass::new(input, copy_shader()));
        let err = report.result.as_ref().unwrap_err();
        assert_eq!(gpu_kind(err), Some(ErrorKind::Api));
        assert!(matches!(
            err,
            RenderError::Gpu(GpuError::ApiCall {
                call: "vkCreateComputePipelines",
                ..
            })
        ));
        assert_eq!(report.failed_stage(), Some(Stage::Pipeline));
        assert!(report.teardown.contains(&ObjectKind::Sampler));
        assert!(!report.teardown.contains(&ObjectKind::Pipeline));
        report.assert_clean();
    }

    #[test]
    fn submit_failure_still_tears_down() {
        let harness = MockHarness::single_queue();
        harness.mock().fail_call("vkQueueSubmit");
        let particles = [Particle::at_rest([0.0, 1.0, 0.0], 1.0)];
        let pass = ParticlePass::new(&particles, 0.1, 9.8, particle_shader()).unwrap();

        let report = harness.run(pass);
        assert!(report.result.is_err());
        assert_eq!(report.failed_stage(), Some(Stage::Submit));
        assert_eq!(harness.mock().stats().dispatches, 0);
        report.assert_clean();
    }

    #[test]
    fn missing_feature_fails_before_any_device() {
        let harness = MockHarness::without_anisotropy();
        let input = RgbaImage::filled(2, 2, [0; 4]).unwrap();

        let report = harness.run(ImagePass::new(input, copy_shader()));
        assert_eq!(report.failed_stage(), Some(Stage::Context));
        assert_eq!(gpu_kind(report.result.as_ref().unwrap_err()), Some(ErrorKind::Environment));
        assert!(report.teardown.is_empty());
        assert!(harness.mock().created_devices().is_empty());
        report.assert_clean();
    }

    #[test]
    fn particles_run_on_the_dedicated_compute_family() {
        let harness = MockHarness::split_queues();
        let particles: Vec<Particle> = (0..10)
            .map(|i| Particle::at_rest([i as f32, 2.0, 0.0], 1.0))
            .collect();
        let pass = ParticlePass::new(&particles, 0.5, 2.0, particle_shader()).unwrap();

        let report = harness.run(pass);
        let output = report.result.as_ref().unwrap();
        assert_eq!(output.len(), 10);
        for particle in output {
            approx::assert_relative_eq!(particle.vertex.normal[1], -1.0);
            approx::assert_relative_eq!(particle.vertex.position[1], 1.5);
        }
        assert_eq!(harness.mock().created_devices()[0].queue_families, vec![1]);
        report.assert_clean();
    }

    #[test]
    fn shadow_pass_needs_tessellation() {
        let harness = MockHarness::without_tessellation();
        let pass = ShadowPass::new(Mesh::plane(4.0), Light::default(), 16, mock_shadow_shaders()).unwrap();

        let report = harness.run(pass);
        assert_eq!(report.failed_stage(), Some(Stage::Context));
        report.assert_clean();
    }

    #[test]
    fn shadow_pass_tears_down_cleanly() {
        let harness = MockHarness::single_queue();
        let mut mesh = Mesh::plane(8.0);
        mesh.merge(&Mesh::cube([0.0, 1.0, 0.0], 2.0));
        let pass = ShadowPass::new(mesh, Light::default(), 32, mock_shadow_shaders()).unwrap();

        let report = harness.run(pass);
        let map = report.result.as_ref().unwrap();
        assert_eq!((map.width, map.height), (32, 32));
        assert_eq!(harness.mock().stats().draws, 1);
        assert_eq!(report.teardown.last(), Some(&ObjectKind::Instance));
        report.assert_clean();
    }

    #[test]
    fn app_runner_drives_the_mock() {
        let harness = MockHarness::single_queue();
        let config = harness.app_config(std::env::temp_dir());
        let input = RgbaImage::filled(3, 5, [9, 8, 7, 255]).unwrap();

        let output = prism_app::run_workload(&config, ImagePass::new(input.clone(), copy_shader())).unwrap();
        assert_eq!(output, input);
        assert!(harness.mock().ledger().live_objects().is_empty());
    }

    #[test]
    fn format_teardown_is_one_kind_per_line() {
        assert_eq!(
            format_teardown(&[ObjectKind::Fence, ObjectKind::Device]),
            "Fence\nDevice"
        );
        assert_eq!(format_teardown(&[]), "");
    }

    // These tests require a GPU and compiled shaders

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn image_pass_on_hardware() {
        let config = AppConfig::new("prism-test").with_validation(true);
        let shader = config
            .shader_library()
            .load(prism_shaders::names::IMAGE_COMP)
            .unwrap();
        let input = RgbaImage::filled(64, 48, [255; 4]).unwrap();

        let output = prism_app::run_workload(&config, ImagePass::new(input.clone(), shader)).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn shadow_pass_on_hardware() {
        let config = AppConfig::new("prism-test").with_validation(true);
        let shaders = ShadowShaders::load(&config.shader_library()).unwrap();
        let pass = ShadowPass::new(Mesh::cube([0.0; 3], 1.0), Light::default(), 128, shaders).unwrap();

        let map = prism_app::run_workload(&config, pass).unwrap();
        assert_eq!(map.depth.len(), 128 * 128);
        assert!(map.depth.iter().all(|d| (0.0..=1.0).contains(d)));
    }
}
