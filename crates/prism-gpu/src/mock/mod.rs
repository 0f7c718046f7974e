//! Software backend for running GPU code without a driver.
//!
//! [`MockInstance`] implements [`InstanceApi`] over a list of
//! [`MockAdapter`]s. Every object it hands out is recorded in a ledger, so
//! tests can assert teardown order, leaks and invalid usage. Compute
//! shaders are replaced by CPU kernels registered against the SPIR-V
//! words of the shader they stand in for.

mod device;
mod kernel;
mod ledger;

pub use kernel::{KernelIo, KernelResult};
pub use ledger::{LedgerEvent, LedgerSnapshot, ObjectKind};

use crate::api::{
    AdapterInfo, DeviceApi, DeviceDesc, GraphicsPipelineDesc, InstanceApi, MemoryProperties,
};
use crate::capabilities::DeviceFeature;
use crate::error::{GpuError, Result};
use ash::vk::{self, Handle};
use device::MockDevice;
use kernel::Kernel;
use ledger::Ledger;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A minimal SPIR-V word stream tagged with `tag`.
///
/// Only the header is present; the mock accepts it as a shader module and
/// uses the words as the key for [`MockInstance::register_kernel`].
pub fn mock_spirv(tag: u32) -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0600, 0x5052_534d, tag, 0]
}

/// Counters of work submitted to the mock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Successful queue submissions
    pub submits: usize,
    /// Dispatches executed
    pub dispatches: usize,
    /// Indexed draws executed
    pub draws: usize,
    /// Queue idle waits
    pub queue_idles: usize,
    /// Device idle waits
    pub device_idles: usize,
}

/// State shared by the instance and all of its devices.
struct Shared {
    ledger: Mutex<Ledger>,
    next_handle: AtomicU64,
    failing: Mutex<Vec<&'static str>>,
    hang_fences: AtomicBool,
    kernels: Mutex<HashMap<Vec<u32>, Kernel>>,
    stats: Mutex<MockStats>,
    last_graphics_pipeline: Mutex<Option<GraphicsPipelineDesc>>,
}

impl Shared {
    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn create(&self, kind: ObjectKind, owner: u64) -> u64 {
        let raw = self.next_handle();
        self.ledger.lock().create(kind, raw, owner);
        raw
    }

    fn destroy(&self, kind: ObjectKind, raw: u64) -> bool {
        self.ledger.lock().destroy(kind, raw)
    }

    fn violate(&self, message: String) {
        self.ledger.lock().violate(message);
    }

    fn check(&self, call: &'static str) -> Result<()> {
        if self.failing.lock().contains(&call) {
            return Err(GpuError::ApiCall {
                call,
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        Ok(())
    }

    fn kernel(&self, code: &[u32]) -> Option<Kernel> {
        self.kernels.lock().get(code).cloned()
    }
}

/// A simulated physical device.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    info: AdapterInfo,
    features: vk::PhysicalDeviceFeatures,
    queue_families: Vec<(vk::QueueFlags, u32)>,
    present: Vec<(u32, vk::SurfaceKHR)>,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    extensions: Vec<String>,
}

impl MockAdapter {
    /// A discrete GPU with one universal queue family and the usual memory
    /// types: device-local, host-visible coherent, and both.
    pub fn new(name: impl Into<String>) -> Self {
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            tessellation_shader: vk::TRUE,
            geometry_shader: vk::TRUE,
            fill_mode_non_solid: vk::TRUE,
            ..Default::default()
        };
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        Self {
            info: AdapterInfo {
                name: name.into(),
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                api_version: vk::API_VERSION_1_3,
                driver_version: 1,
                vendor_id: 0x10005,
                max_compute_workgroup_size: [1024, 1024, 64],
                max_compute_workgroup_invocations: 1024,
                max_sampler_anisotropy: 16.0,
            },
            features,
            queue_families: vec![(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
            )],
            present: Vec::new(),
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                host,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | host,
            ],
            extensions: Vec::new(),
        }
    }

    /// Replace the queue families as `(flags, queue count)` pairs.
    #[must_use]
    pub fn queue_families(mut self, families: Vec<(vk::QueueFlags, u32)>) -> Self {
        self.queue_families = families;
        self
    }

    /// Let `family` present to `surface`.
    #[must_use]
    pub fn present_support(mut self, family: u32, surface: vk::SurfaceKHR) -> Self {
        self.present.push((family, surface));
        self
    }

    /// Replace the memory types.
    #[must_use]
    pub fn memory_types(mut self, types: Vec<vk::MemoryPropertyFlags>) -> Self {
        self.memory_types = types;
        self
    }

    /// Replace the supported features.
    #[must_use]
    pub const fn features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Replace the supported device extensions.
    #[must_use]
    pub fn extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set the device type.
    #[must_use]
    pub const fn device_type(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.info.device_type = device_type;
        self
    }

    /// Set the PCI vendor ID.
    #[must_use]
    pub const fn vendor_id(mut self, vendor_id: u32) -> Self {
        self.info.vendor_id = vendor_id;
        self
    }

    fn memory_properties(&self) -> MemoryProperties {
        let types = self
            .memory_types
            .iter()
            .map(|&property_flags| vk::MemoryType {
                property_flags,
                heap_index: u32::from(!property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)),
            })
            .collect();
        let heaps = vec![
            vk::MemoryHeap {
                size: 4 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            },
            vk::MemoryHeap {
                size: 8 << 30,
                flags: vk::MemoryHeapFlags::empty(),
            },
        ];
        MemoryProperties { types, heaps }
    }
}

/// A simulated Vulkan instance.
pub struct MockInstance {
    raw: u64,
    adapters: Vec<MockAdapter>,
    shared: Arc<Shared>,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    created: Mutex<Vec<DeviceDesc>>,
}

impl MockInstance {
    /// Create an instance exposing `adapters` in order.
    pub fn new(adapters: Vec<MockAdapter>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            ledger: Mutex::new(Ledger::default()),
            next_handle: AtomicU64::new(0x1000),
            failing: Mutex::new(Vec::new()),
            hang_fences: AtomicBool::new(false),
            kernels: Mutex::new(HashMap::new()),
            stats: Mutex::new(MockStats::default()),
            last_graphics_pipeline: Mutex::new(None),
        });
        let raw = shared.create(ObjectKind::Instance, 0);
        Arc::new(Self {
            raw,
            adapters,
            shared,
            devices: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the create/destroy ledger.
    pub fn ledger(&self) -> LedgerSnapshot {
        self.shared.ledger.lock().snapshot()
    }

    /// Work counters.
    pub fn stats(&self) -> MockStats {
        *self.shared.stats.lock()
    }

    /// Make every later call to the named entry point fail.
    pub fn fail_call(&self, call: &'static str) {
        self.shared.failing.lock().push(call);
    }

    /// Undo every [`fail_call`](Self::fail_call).
    pub fn clear_failures(&self) {
        self.shared.failing.lock().clear();
    }

    /// Leave fences unsignaled after submission, so fence waits time out.
    pub fn never_signal_fences(&self) {
        self.shared.hang_fences.store(true, Ordering::SeqCst);
    }

    /// Run `kernel` for every dispatch of a pipeline built from `code`.
    pub fn register_kernel<F>(&self, code: &[u32], kernel: F)
    where
        F: Fn(&mut KernelIo<'_>) -> KernelResult<()> + Send + Sync + 'static,
    {
        self.shared.kernels.lock().insert(code.to_vec(), Arc::new(kernel));
    }

    /// Parameters of every device created so far.
    pub fn created_devices(&self) -> Vec<DeviceDesc> {
        self.created.lock().clone()
    }

    /// Description of the most recently created graphics pipeline.
    pub fn last_graphics_pipeline(&self) -> Option<GraphicsPipelineDesc> {
        self.shared.last_graphics_pipeline.lock().clone()
    }

    /// Tracked layout of `image`.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.devices
            .lock()
            .iter()
            .find_map(|device| device.image_layout(image.as_raw()))
    }

    /// First `len` bytes of an allocation, host-visible or not.
    pub fn memory_bytes(&self, memory: vk::DeviceMemory, len: usize) -> Option<Vec<u8>> {
        self.devices
            .lock()
            .iter()
            .find_map(|device| device.memory_bytes(memory.as_raw(), len))
    }

    fn adapter(&self, physical_device: vk::PhysicalDevice) -> Option<&MockAdapter> {
        let index = physical_device.as_raw().checked_sub(1)?;
        self.adapters.get(usize::try_from(index).ok()?)
    }
}

impl InstanceApi for MockInstance {
    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        self.shared.check("vkEnumeratePhysicalDevices")?;
        Ok((1..=self.adapters.len() as u64)
            .map(vk::PhysicalDevice::from_raw)
            .collect())
    }

    fn adapter_info(&self, physical_device: vk::PhysicalDevice) -> AdapterInfo {
        match self.adapter(physical_device) {
            Some(adapter) => adapter.info.clone(),
            None => MockAdapter::new("unknown").info,
        }
    }

    fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
        self.adapter(physical_device)
            .map(|adapter| adapter.features)
            .unwrap_or_default()
    }

    fn queue_families(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        self.adapter(physical_device)
            .map(|adapter| {
                adapter
                    .queue_families
                    .iter()
                    .map(|&(queue_flags, queue_count)| vk::QueueFamilyProperties {
                        queue_flags,
                        queue_count,
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn memory_properties(&self, physical_device: vk::PhysicalDevice) -> MemoryProperties {
        self.adapter(physical_device)
            .map(MockAdapter::memory_properties)
            .unwrap_or_default()
    }

    fn device_extensions(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<String>> {
        self.shared.check("vkEnumerateDeviceExtensionProperties")?;
        Ok(self
            .adapter(physical_device)
            .map(|adapter| adapter.extensions.clone())
            .unwrap_or_default())
    }

    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool> {
        self.shared.check("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        Ok(self
            .adapter(physical_device)
            .is_some_and(|adapter| adapter.present.contains(&(family, surface))))
    }

    fn create_device(&self, physical_device: vk::PhysicalDevice, desc: &DeviceDesc) -> Result<Arc<dyn DeviceApi>> {
        self.shared.check("vkCreateDevice")?;
        let adapter = self.adapter(physical_device).ok_or(GpuError::ApiCall {
            call: "vkCreateDevice",
            result: vk::Result::ERROR_INITIALIZATION_FAILED,
        })?;

        if DeviceFeature::ALL
            .iter()
            .any(|f| f.is_supported(&desc.features) && !f.is_supported(&adapter.features))
        {
            return Err(GpuError::ApiCall {
                call: "vkCreateDevice",
                result: vk::Result::ERROR_FEATURE_NOT_PRESENT,
            });
        }
        if desc.extensions.iter().any(|name| !adapter.extensions.contains(name)) {
            return Err(GpuError::ApiCall {
                call: "vkCreateDevice",
                result: vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            });
        }
        for (i, family) in desc.queue_families.iter().enumerate() {
            if desc.queue_families[..i].contains(family) {
                self.shared
                    .violate(format!("vkCreateDevice: queue family {family} requested twice"));
            }
            if *family as usize >= adapter.queue_families.len() {
                self.shared
                    .violate(format!("vkCreateDevice: queue family {family} does not exist"));
            }
        }

        let raw = self.shared.create(ObjectKind::Device, self.raw);
        let device = Arc::new(MockDevice::new(
            raw,
            desc.clone(),
            adapter.memory_types.clone(),
            self.shared.clone(),
        ));
        self.devices.lock().push(device.clone());
        self.created.lock().push(desc.clone());
        Ok(device)
    }

    fn destroy_instance(&self) {
        let mut ledger = self.shared.ledger.lock();
        let devices = ledger.live_of_kind(ObjectKind::Device);
        if devices > 0 {
            ledger.violate(format!("vkDestroyInstance: {devices} device(s) still alive"));
        }
        ledger.destroy(ObjectKind::Instance, self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_is_recorded_at_creation() {
        let mock = MockInstance::new(Vec::new());
        let ledger = mock.ledger();
        assert_eq!(ledger.created_count(ObjectKind::Instance), 1);
        assert_eq!(ledger.live_count(ObjectKind::Instance), 1);
        mock.destroy_instance();
        assert!(mock.ledger().live_objects().is_empty());
    }

    #[test]
    fn destroying_instance_before_device_is_flagged() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let pd = mock.enumerate_physical_devices().unwrap()[0];
        let desc = DeviceDesc {
            queue_families: vec![0],
            ..Default::default()
        };
        let device = mock.create_device(pd, &desc).unwrap();
        mock.destroy_instance();
        assert_eq!(mock.ledger().violations().len(), 1);
        device.destroy_device();
    }

    #[test]
    fn unsupported_feature_fails_device_creation() {
        let mock = MockInstance::new(vec![
            MockAdapter::new("Plain").features(vk::PhysicalDeviceFeatures::default())
        ]);
        let pd = mock.enumerate_physical_devices().unwrap()[0];
        let desc = DeviceDesc {
            queue_families: vec![0],
            features: vk::PhysicalDeviceFeatures {
                shader_int64: vk::TRUE,
                ..Default::default()
            },
            extensions: Vec::new(),
        };
        assert!(matches!(
            mock.create_device(pd, &desc),
            Err(GpuError::ApiCall {
                result: vk::Result::ERROR_FEATURE_NOT_PRESENT,
                ..
            })
        ));
    }

    #[test]
    fn failing_call_reports_its_name() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        mock.fail_call("vkEnumeratePhysicalDevices");
        assert!(matches!(
            mock.enumerate_physical_devices(),
            Err(GpuError::ApiCall {
                call: "vkEnumeratePhysicalDevices",
                ..
            })
        ));
        mock.clear_failures();
        assert_eq!(mock.enumerate_physical_devices().unwrap().len(), 1);
    }

    #[test]
    fn device_destroyed_with_children_is_flagged() {
        let mock = MockInstance::new(vec![MockAdapter::new("GPU")]);
        let pd = mock.enumerate_physical_devices().unwrap()[0];
        let device = mock
            .create_device(
                pd,
                &DeviceDesc {
                    queue_families: vec![0],
                    ..Default::default()
                },
            )
            .unwrap();
        let buffer = device
            .create_buffer(16, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        device.destroy_device();
        let ledger = mock.ledger();
        assert_eq!(ledger.violations().len(), 1);
        assert!(ledger.violations()[0].contains("live children"));
        assert_eq!(ledger.live_count(ObjectKind::Buffer), 1);
        assert_ne!(buffer, vk::Buffer::null());
    }

    #[test]
    fn submitting_to_another_family_is_flagged() {
        let mock = MockInstance::new(vec![MockAdapter::new("Split").queue_families(vec![
            (vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::GRAPHICS, 1),
        ])]);
        let pd = mock.enumerate_physical_devices().unwrap()[0];
        let device = mock
            .create_device(
                pd,
                &DeviceDesc {
                    queue_families: vec![0, 1],
                    ..Default::default()
                },
            )
            .unwrap();
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cmd, true).unwrap();
        device.end_command_buffer(cmd).unwrap();

        device
            .queue_submit(device.get_queue(0, 0), &[cmd], vk::Fence::null())
            .unwrap();
        assert!(mock.ledger().violations().is_empty());

        device
            .queue_submit(device.get_queue(1, 0), &[cmd], vk::Fence::null())
            .unwrap();
        let ledger = mock.ledger();
        assert_eq!(ledger.violations().len(), 1);
        assert!(ledger.violations()[0].contains("queue family 1"));

        device.free_command_buffer(pool, cmd);
        device.destroy_command_pool(pool);
        device.destroy_device();
    }

    #[test]
    fn mock_spirv_has_magic_and_tag() {
        let code = mock_spirv(7);
        assert_eq!(code[0], SPIRV_MAGIC);
        assert_eq!(code[3], 7);
        assert_ne!(mock_spirv(7), mock_spirv(8));
    }
}
