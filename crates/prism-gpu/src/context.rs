//! GPU context management.

use crate::api::{DeviceApi, DeviceDesc, InstanceApi, MemoryProperties};
use crate::capabilities::{enabled_features, DeviceFeature, GpuCapabilities};
use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use crate::instance::{Instance, InstanceConfig};
use crate::memory::GpuAllocator;
use crate::queue::{resolve_queue_families, Capability, Queue, QueueFamilyMap};
use ash::vk;
use std::sync::Arc;

/// Owner of the logical device.
///
/// Every device-level wrapper holds an `Arc<Device>`, so the device outlives
/// its children; the device in turn keeps the instance alive.
pub struct Device {
    api: Arc<dyn DeviceApi>,
    physical_device: vk::PhysicalDevice,
    memory_properties: MemoryProperties,
    _instance: Arc<Instance>,
}

impl Device {
    /// Backend calls.
    pub fn api(&self) -> &dyn DeviceApi {
        self.api.as_ref()
    }

    /// The physical device this device was created on.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Memory types and heaps of the physical device.
    pub const fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.api.device_wait_idle()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.api.device_wait_idle() {
            tracing::warn!("Device wait idle failed during teardown: {}", e);
        }
        tracing::trace!("Destroying logical device");
        self.api.destroy_device();
    }
}

/// What a workload needs from a physical device.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequirements {
    /// Queue capabilities; the first one selects the primary queue family
    pub capabilities: Vec<Capability>,
    /// Core features that must be present and are enabled
    pub features: Vec<DeviceFeature>,
    /// Device extensions that must be present
    pub extensions: Vec<String>,
    /// Device extensions enabled when present
    pub optional_extensions: Vec<String>,
}

impl DeviceRequirements {
    /// Requirements with the given queue capabilities.
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Require a core feature.
    pub fn feature(mut self, feature: DeviceFeature) -> Self {
        if !self.features.contains(&feature) {
            self.features.push(feature);
        }
        self
    }

    /// Require a device extension.
    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    /// Enable a device extension if the device has it.
    pub fn optional_extension(mut self, name: impl Into<String>) -> Self {
        self.optional_extensions.push(name.into());
        self
    }
}

/// A physical device that passed selection.
struct Candidate {
    physical_device: vk::PhysicalDevice,
    queues: QueueFamilyMap,
    capabilities: GpuCapabilities,
    memory_properties: MemoryProperties,
}

/// Pick the first physical device that satisfies `requirements`.
fn select_physical_device(
    instance: &dyn InstanceApi,
    requirements: &DeviceRequirements,
) -> Result<Candidate> {
    let devices = instance.enumerate_physical_devices()?;
    if devices.is_empty() {
        return Err(GpuError::NoPhysicalDevice);
    }

    for physical_device in devices {
        let info = instance.adapter_info(physical_device);
        let features = instance.features(physical_device);

        if let Some(missing) = requirements
            .features
            .iter()
            .find(|feature| !feature.is_supported(&features))
        {
            tracing::debug!("Skipping {}: missing feature {:?}", info.name, missing);
            continue;
        }

        let extensions = match instance.device_extensions(physical_device) {
            Ok(extensions) => extensions,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", info.name, e);
                continue;
            }
        };
        if let Some(missing) = requirements
            .extensions
            .iter()
            .find(|name| !extensions.contains(name))
        {
            tracing::debug!("Skipping {}: missing extension {}", info.name, missing);
            continue;
        }

        let families = instance.queue_families(physical_device);
        let queues = match resolve_queue_families(&families, &requirements.capabilities, |family, surface| {
            instance.surface_support(physical_device, family, surface)
        }) {
            Ok(queues) => queues,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", info.name, e);
                continue;
            }
        };

        let memory_properties = instance.memory_properties(physical_device);
        let capabilities = GpuCapabilities::new(&info, &memory_properties, features, extensions);
        return Ok(Candidate {
            physical_device,
            queues,
            capabilities,
            memory_properties,
        });
    }

    Err(GpuError::NoSuitableDevice)
}

/// Main GPU context: selected device, its queues and a transient command pool.
pub struct GpuContext {
    transient_pool: Arc<CommandPool>,
    queues: Vec<Queue>,
    queue_families: QueueFamilyMap,
    capabilities: GpuCapabilities,
    device: Arc<Device>,
}

impl GpuContext {
    /// Shared logical device.
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Capability to family mapping.
    pub const fn queue_families(&self) -> &QueueFamilyMap {
        &self.queue_families
    }

    /// Queue serving `capability`.
    pub fn queue(&self, capability: Capability) -> Result<Queue> {
        let family = self
            .queue_families
            .family(capability)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("queue for {capability}")))?;
        self.queue_for_family(family)
    }

    /// Queue created for `family`.
    pub fn queue_for_family(&self, family: u32) -> Result<Queue> {
        self.queues
            .iter()
            .find(|queue| queue.family == family)
            .copied()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("queue family {family}")))
    }

    /// Family of the first requested capability.
    pub fn primary_family(&self) -> u32 {
        self.transient_pool.queue_family()
    }

    /// Queue of the primary family.
    pub fn primary_queue(&self) -> Result<Queue> {
        self.queue_for_family(self.primary_family())
    }

    /// Command pool for one-shot and workload command buffers.
    pub const fn command_pool(&self) -> &Arc<CommandPool> {
        &self.transient_pool
    }

    /// Allocator submitting one-shot work to the primary queue.
    pub fn allocator(&self) -> Result<GpuAllocator> {
        Ok(GpuAllocator::new(
            self.device.clone(),
            self.transient_pool.clone(),
            self.primary_queue()?,
        ))
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// Builder for creating a GPU context.
#[derive(Clone, Default)]
pub struct GpuContextBuilder {
    instance_config: InstanceConfig,
    requirements: DeviceRequirements,
    instance: Option<Arc<dyn InstanceApi>>,
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.instance_config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.instance_config.set_validation(enable);
        self
    }

    /// Replace the instance configuration.
    pub fn instance_config(mut self, config: InstanceConfig) -> Self {
        self.instance_config = config;
        self
    }

    /// Set the device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Use an already created instance instead of loading Vulkan.
    pub fn instance(mut self, instance: Arc<dyn InstanceApi>) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Current device requirements.
    pub const fn device_requirements(&self) -> &DeviceRequirements {
        &self.requirements
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let api = match self.instance {
            Some(api) => api,
            None => Arc::new(crate::vulkan::VulkanInstance::new(&self.instance_config)?),
        };
        let instance = Arc::new(Instance::from_api(api));

        let candidate = select_physical_device(instance.api(), &self.requirements)?;
        tracing::info!("Selected GPU: {}", candidate.capabilities.summary());

        let primary = candidate.queues.primary_family().ok_or_else(|| {
            GpuError::InvalidState("at least one queue capability is required".to_string())
        })?;

        let mut extensions = self.requirements.extensions.clone();
        for name in &self.requirements.optional_extensions {
            if candidate.capabilities.has_extension(name) {
                extensions.push(name.clone());
            } else {
                tracing::warn!("Device extension {} not available", name);
            }
        }

        let families = candidate.queues.distinct_families();
        let desc = DeviceDesc {
            queue_families: families.clone(),
            features: enabled_features(&self.requirements.features),
            extensions,
        };
        let api = instance
            .api()
            .create_device(candidate.physical_device, &desc)?;
        let device = Arc::new(Device {
            api,
            physical_device: candidate.physical_device,
            memory_properties: candidate.memory_properties,
            _instance: instance,
        });

        let queues: Vec<Queue> = families
            .iter()
            .map(|&family| Queue {
                handle: device.api().get_queue(family, 0),
                family,
            })
            .collect();

        let transient_pool = Arc::new(CommandPool::new(
            &device,
            primary,
            vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?);

        Ok(GpuContext {
            transient_pool,
            queues,
            queue_families: candidate.queues,
            capabilities: candidate.capabilities,
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockInstance, ObjectKind};

    #[test]
    fn selects_first_suitable_device() {
        let mock = MockInstance::new(vec![
            MockAdapter::new("No compute").queue_families(vec![(vk::QueueFlags::TRANSFER, 1)]),
            MockAdapter::new("First"),
            MockAdapter::new("Second"),
        ]);
        let ctx = GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Compute]))
            .instance(mock.clone())
            .build()
            .unwrap();
        assert_eq!(ctx.capabilities().device_name, "First");
        assert_eq!(ctx.primary_family(), 0);
        assert!(ctx.primary_queue().is_ok());
    }

    #[test]
    fn no_devices_is_distinct_from_no_suitable_device() {
        let empty = MockInstance::new(Vec::new());
        let err = GpuContextBuilder::new()
            .instance(empty)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::NoPhysicalDevice));

        let no_tess = MockInstance::new(vec![MockAdapter::new("Basic")
            .features(vk::PhysicalDeviceFeatures::default())]);
        let err = GpuContextBuilder::new()
            .requirements(
                DeviceRequirements::new([Capability::Graphics])
                    .feature(DeviceFeature::TessellationShader),
            )
            .instance(no_tess)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::NoSuitableDevice));
    }

    #[test]
    fn one_queue_per_distinct_family() {
        let mock = MockInstance::new(vec![MockAdapter::new("Split").queue_families(vec![
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
            (vk::QueueFlags::COMPUTE, 2),
        ])]);
        let ctx = GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([
                Capability::Compute,
                Capability::Graphics,
                Capability::Transfer,
            ]))
            .instance(mock.clone())
            .build()
            .unwrap();
        assert_eq!(ctx.primary_family(), 1);
        assert_eq!(ctx.queue_families().distinct_families(), vec![1, 0]);
        assert_eq!(mock.created_devices()[0].queue_families, vec![1, 0]);
        assert_ne!(
            ctx.queue(Capability::Compute).unwrap(),
            ctx.queue(Capability::Graphics).unwrap()
        );
    }

    #[test]
    fn enables_exactly_required_features() {
        let mock = MockInstance::new(vec![MockAdapter::new("Full")]);
        let _ctx = GpuContextBuilder::new()
            .requirements(
                DeviceRequirements::new([Capability::Compute])
                    .feature(DeviceFeature::SamplerAnisotropy),
            )
            .instance(mock.clone())
            .build()
            .unwrap();
        let desc = &mock.created_devices()[0];
        assert!(DeviceFeature::SamplerAnisotropy.is_supported(&desc.features));
        assert!(!DeviceFeature::TessellationShader.is_supported(&desc.features));
    }

    #[test]
    fn optional_extensions_only_when_present() {
        let mock = MockInstance::new(vec![
            MockAdapter::new("Ext").extensions(vec!["VK_KHR_present_id".to_string()])
        ]);
        let _ctx = GpuContextBuilder::new()
            .requirements(
                DeviceRequirements::new([Capability::Graphics])
                    .optional_extension("VK_KHR_present_id")
                    .optional_extension("VK_EXT_missing"),
            )
            .instance(mock.clone())
            .build()
            .unwrap();
        assert_eq!(
            mock.created_devices()[0].extensions,
            vec!["VK_KHR_present_id".to_string()]
        );
    }

    #[test]
    fn dropping_context_destroys_pool_device_then_instance() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let ctx = GpuContextBuilder::new()
            .requirements(DeviceRequirements::new([Capability::Compute]))
            .instance(mock.clone())
            .build()
            .unwrap();
        drop(ctx);
        let ledger = mock.ledger();
        assert!(ledger.violations().is_empty(), "{:?}", ledger.violations());
        assert!(ledger.live_objects().is_empty());
        assert_eq!(
            ledger.destroy_order(),
            vec![ObjectKind::CommandPool, ObjectKind::Device, ObjectKind::Instance]
        );
    }
}
