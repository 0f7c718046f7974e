//! Backend over a real Vulkan driver.

mod device;

pub use device::VulkanDevice;

use crate::api::{AdapterInfo, DeviceApi, DeviceDesc, InstanceApi, MemoryProperties};
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::{negotiate, InstanceConfig, Request, RequestKind};
use ash::vk;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

/// Vulkan instance with the loader it was created from.
pub struct VulkanInstance {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface: Option<ash::khr::surface::Instance>,
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| GpuError::InvalidState(format!("name {name:?} contains a NUL byte")))
        })
        .collect()
}

fn c_str_name(name: std::result::Result<&CStr, std::ffi::FromBytesUntilNulError>) -> Option<String> {
    name.ok().map(|name| name.to_string_lossy().into_owned())
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback data pointer for the
    // duration of the call.
    let message = unsafe { (*callback_data).message_as_c_str() }
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => tracing::error!(target: "vulkan", "{}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => tracing::warn!(target: "vulkan", "{}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => tracing::debug!(target: "vulkan", "{}", message),
        _ => tracing::trace!(target: "vulkan", "{}", message),
    }
    vk::FALSE
}

impl VulkanInstance {
    /// Load Vulkan and create an instance.
    ///
    /// Required layers and extensions that are missing fail with
    /// [`GpuError::MissingLayer`] / [`GpuError::MissingExtension`]; optional
    /// ones are dropped with a warning. When validation is enabled and
    /// `VK_EXT_debug_utils` is available, driver messages are forwarded to
    /// `tracing`.
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        // SAFETY: the loaded library is only used through `entry`, which is
        // kept alive for the lifetime of the instance.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        // SAFETY: no preconditions.
        let available_layers: Vec<String> = unsafe { entry.enumerate_instance_layer_properties() }
            .check("vkEnumerateInstanceLayerProperties")?
            .iter()
            .filter_map(|props| c_str_name(props.layer_name_as_c_str()))
            .collect();
        // SAFETY: no preconditions.
        let available_extensions: Vec<String> =
            unsafe { entry.enumerate_instance_extension_properties(None) }
                .check("vkEnumerateInstanceExtensionProperties")?
                .iter()
                .filter_map(|props| c_str_name(props.extension_name_as_c_str()))
                .collect();

        let layers = negotiate(RequestKind::Layer, &config.layers, &available_layers)?;

        let debug_name = ash::ext::debug_utils::NAME.to_string_lossy().into_owned();
        let mut extension_requests = config.extensions.clone();
        if config.validation_enabled() {
            extension_requests.push(Request::optional(debug_name.clone()));
        }
        let extensions = negotiate(RequestKind::Extension, &extension_requests, &available_extensions)?;

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|_| GpuError::InvalidState("application name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Prism")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(config.api_version);

        let layer_names = to_cstrings(&layers)?;
        let extension_names = to_cstrings(&extensions)?;
        let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        // SAFETY: every pointer in `create_info` outlives the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }.check("vkCreateInstance")?;
        tracing::info!(
            "Created Vulkan instance (layers: {:?}, extensions: {:?})",
            layers,
            extensions
        );

        let debug_messenger = if extensions.contains(&debug_name) {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            // SAFETY: the messenger is destroyed before the instance.
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((messenger, loader)),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_name = ash::khr::surface::NAME.to_string_lossy();
        let surface = extensions
            .iter()
            .any(|name| *name == surface_name)
            .then(|| ash::khr::surface::Instance::new(&entry, &instance));

        Ok(Self {
            _entry: entry,
            instance,
            debug_messenger,
            surface,
        })
    }
}

impl InstanceApi for VulkanInstance {
    fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        // SAFETY: the instance is valid until `destroy_instance`.
        unsafe { self.instance.enumerate_physical_devices() }.check("vkEnumeratePhysicalDevices")
    }

    fn adapter_info(&self, physical_device: vk::PhysicalDevice) -> AdapterInfo {
        // SAFETY: `physical_device` was enumerated from this instance.
        let props = unsafe { self.instance.get_physical_device_properties(physical_device) };
        AdapterInfo {
            name: c_str_name(props.device_name_as_c_str()).unwrap_or_default(),
            device_type: props.device_type,
            api_version: props.api_version,
            driver_version: props.driver_version,
            vendor_id: props.vendor_id,
            max_compute_workgroup_size: props.limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: props.limits.max_compute_work_group_invocations,
            max_sampler_anisotropy: props.limits.max_sampler_anisotropy,
        }
    }

    fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
        // SAFETY: `physical_device` was enumerated from this instance.
        unsafe { self.instance.get_physical_device_features(physical_device) }
    }

    fn queue_families(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: `physical_device` was enumerated from this instance.
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    fn memory_properties(&self, physical_device: vk::PhysicalDevice) -> MemoryProperties {
        // SAFETY: `physical_device` was enumerated from this instance.
        let props = unsafe {
            self.instance
                .get_physical_device_memory_properties(physical_device)
        };
        MemoryProperties {
            types: props.memory_types[..props.memory_type_count as usize].to_vec(),
            heaps: props.memory_heaps[..props.memory_heap_count as usize].to_vec(),
        }
    }

    fn device_extensions(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<String>> {
        // SAFETY: `physical_device` was enumerated from this instance.
        let props = unsafe {
            self.instance
                .enumerate_device_extension_properties(physical_device)
        }
        .check("vkEnumerateDeviceExtensionProperties")?;
        Ok(props
            .iter()
            .filter_map(|p| c_str_name(p.extension_name_as_c_str()))
            .collect())
    }

    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool> {
        let loader = self
            .surface
            .as_ref()
            .ok_or_else(|| GpuError::MissingExtension("VK_KHR_surface".to_string()))?;
        // SAFETY: the surface belongs to this instance.
        unsafe { loader.get_physical_device_surface_support(physical_device, family, surface) }
            .check("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    fn create_device(
        &self,
        physical_device: vk::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> Result<Arc<dyn DeviceApi>> {
        let priority = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = desc
            .queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priority)
            })
            .collect();

        let extension_names = to_cstrings(&desc.extensions)?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|n| n.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&desc.features)
            .push_next(&mut vulkan_1_3_features);

        // SAFETY: every pointer in `create_info` outlives the call.
        let device = unsafe {
            self.instance
                .create_device(physical_device, &create_info, None)
        }
        .check("vkCreateDevice")?;
        tracing::debug!(
            "Created logical device with queue families {:?}",
            desc.queue_families
        );
        Ok(Arc::new(VulkanDevice::new(device)))
    }

    fn destroy_instance(&self) {
        if let Some((messenger, loader)) = &self.debug_messenger {
            // SAFETY: created from this instance, destroyed exactly once here.
            unsafe { loader.destroy_debug_utils_messenger(*messenger, None) };
        }
        // SAFETY: called once, after every device is destroyed.
        unsafe { self.instance.destroy_instance(None) };
    }
}
