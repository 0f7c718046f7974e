//! Application runner: logging, configuration and workload execution.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use prism_gpu::{GpuContextBuilder, InstanceApi, Lifecycle, Workload};
use prism_shaders::ShaderLibrary;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Application name reported to the driver and used in logs.
    pub name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Directory output files are written to.
    pub output_dir: PathBuf,
    /// Directory compiled shaders are read from; `None` uses the library default.
    pub shader_dir: Option<PathBuf>,
    /// Instance to run on instead of loading Vulkan.
    pub instance: Option<Arc<dyn InstanceApi>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Prism".to_string(),
            validation: cfg!(debug_assertions),
            output_dir: PathBuf::from("."),
            shader_dir: None,
            instance: None,
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("name", &self.name)
            .field("validation", &self.validation)
            .field("output_dir", &self.output_dir)
            .field("shader_dir", &self.shader_dir)
            .field("instance", &self.instance.is_some())
            .finish()
    }
}

impl AppConfig {
    /// Create a new config with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the shader directory.
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = Some(dir.into());
        self
    }

    /// Run on `instance` instead of the system Vulkan driver.
    pub fn with_instance(mut self, instance: Arc<dyn InstanceApi>) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Path of `file_name` inside the output directory.
    pub fn output_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.output_dir.join(file_name)
    }

    /// Shader library for the configured directory.
    pub fn shader_library(&self) -> ShaderLibrary {
        self.shader_dir
            .as_ref()
            .map_or_else(ShaderLibrary::default, ShaderLibrary::new)
    }

    /// Context builder for this configuration.
    pub fn context_builder(&self) -> GpuContextBuilder {
        let builder = GpuContextBuilder::new()
            .app_name(self.name.clone())
            .validation(self.validation);
        match &self.instance {
            Some(instance) => builder.instance(instance.clone()),
            None => builder,
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this more
/// than once keeps the first subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run `workload` to completion and tear everything down.
///
/// Teardown happens on success and on failure; the error names the workload.
pub fn run_workload<W>(config: &AppConfig, workload: W) -> anyhow::Result<W::Output>
where
    W: Workload,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let name = workload.name().to_string();
    let mut lifecycle = Lifecycle::new(workload, config.context_builder());
    let result = lifecycle.run();
    if let Some(ctx) = lifecycle.context() {
        info!("Ran '{}' on {}", name, ctx.capabilities().summary());
    }
    lifecycle.cleanup();
    result.with_context(|| format!("workload '{name}' failed"))
}

/// Initialize logging, run `main` and map its result to an exit status.
pub fn run_app<F>(config: &AppConfig, main: F) -> ExitCode
where
    F: FnOnce(&AppConfig) -> anyhow::Result<()>,
{
    init_logging();
    info!("{} starting...", config.name);
    match main(config) {
        Ok(()) => {
            info!("{} finished", config.name);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{} failed: {:#}", config.name, e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::mock::{MockAdapter, MockInstance};
    use prism_gpu::{Capability, DeviceRequirements, GpuContext, GpuError};

    struct Stub {
        fail: bool,
    }

    impl Workload for Stub {
        type Output = String;
        type Error = GpuError;

        fn name(&self) -> &str {
            "stub"
        }

        fn requirements(&self) -> DeviceRequirements {
            DeviceRequirements::new([Capability::Transfer])
        }

        fn create_resources(&mut self, _ctx: &GpuContext) -> Result<(), GpuError> {
            if self.fail {
                return Err(GpuError::InvalidState("stub failure".to_string()));
            }
            Ok(())
        }

        fn build_descriptors(&mut self, _ctx: &GpuContext) -> Result<(), GpuError> {
            Ok(())
        }

        fn build_pipeline(&mut self, _ctx: &GpuContext) -> Result<(), GpuError> {
            Ok(())
        }

        fn record_and_submit(&mut self, _ctx: &GpuContext) -> Result<(), GpuError> {
            Ok(())
        }

        fn export(&mut self, ctx: &GpuContext) -> Result<String, GpuError> {
            Ok(ctx.capabilities().device_name.clone())
        }

        fn release(&mut self) {}
    }

    #[test]
    fn default_config() {
        let config = AppConfig::default();
        assert_eq!(config.name, "Prism");
        assert_eq!(config.validation, cfg!(debug_assertions));
        assert_eq!(config.output_path("a.png"), PathBuf::from("./a.png"));
    }

    #[test]
    fn config_builder() {
        let config = AppConfig::new("demo")
            .with_validation(false)
            .with_output_dir("/tmp/out")
            .with_shader_dir("/tmp/spv");
        assert!(!config.validation);
        assert_eq!(config.output_path("x.png"), PathBuf::from("/tmp/out/x.png"));
        assert_eq!(config.shader_library().root(), Path::new("/tmp/spv"));
    }

    #[test]
    fn runs_workload_on_configured_instance() {
        let mock = MockInstance::new(vec![MockAdapter::new("Stub GPU")]);
        let config = AppConfig::new("test").with_instance(mock.clone());
        let name = run_workload(&config, Stub { fail: false }).unwrap();
        assert_eq!(name, "Stub GPU");
        assert!(mock.ledger().live_objects().is_empty());
    }

    #[test]
    fn failure_names_the_workload_and_still_cleans_up() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let config = AppConfig::new("test").with_instance(mock.clone());
        let err = run_workload(&config, Stub { fail: true }).unwrap_err();
        assert!(err.to_string().contains("stub"));
        assert!(format!("{err:#}").contains("stub failure"));
        assert!(mock.ledger().live_objects().is_empty());
        assert!(mock.ledger().violations().is_empty());
    }

    #[test]
    fn run_app_maps_errors_to_exit_code() {
        let config = AppConfig::new("test");
        assert_eq!(run_app(&config, |_| Ok(())), ExitCode::SUCCESS);
        assert_eq!(
            run_app(&config, |_| Err(anyhow::anyhow!("boom"))),
            ExitCode::FAILURE
        );
    }
}
