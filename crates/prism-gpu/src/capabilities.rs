//! GPU capability detection.

use crate::api::{AdapterInfo, MemoryProperties};
use ash::vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// A core device feature a workload can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFeature {
    /// Anisotropic texture filtering
    SamplerAnisotropy,
    /// Tessellation control and evaluation stages
    TessellationShader,
    /// Geometry shader stage
    GeometryShader,
    /// Line and point polygon modes
    FillModeNonSolid,
    /// Depth clamping
    DepthClamp,
    /// 64-bit integers in shaders
    ShaderInt64,
}

impl DeviceFeature {
    /// Every feature this crate knows how to request.
    pub const ALL: [Self; 6] = [
        Self::SamplerAnisotropy,
        Self::TessellationShader,
        Self::GeometryShader,
        Self::FillModeNonSolid,
        Self::DepthClamp,
        Self::ShaderInt64,
    ];

    /// Returns true if `features` reports this feature.
    pub const fn is_supported(self, features: &vk::PhysicalDeviceFeatures) -> bool {
        let flag = match self {
            Self::SamplerAnisotropy => features.sampler_anisotropy,
            Self::TessellationShader => features.tessellation_shader,
            Self::GeometryShader => features.geometry_shader,
            Self::FillModeNonSolid => features.fill_mode_non_solid,
            Self::DepthClamp => features.depth_clamp,
            Self::ShaderInt64 => features.shader_int64,
        };
        flag == vk::TRUE
    }

    /// Set this feature in `features`.
    pub fn enable(self, features: &mut vk::PhysicalDeviceFeatures) {
        let flag = match self {
            Self::SamplerAnisotropy => &mut features.sampler_anisotropy,
            Self::TessellationShader => &mut features.tessellation_shader,
            Self::GeometryShader => &mut features.geometry_shader,
            Self::FillModeNonSolid => &mut features.fill_mode_non_solid,
            Self::DepthClamp => &mut features.depth_clamp,
            Self::ShaderInt64 => &mut features.shader_int64,
        };
        *flag = vk::TRUE;
    }
}

/// Build a feature struct with exactly the listed features enabled.
pub fn enabled_features(list: &[DeviceFeature]) -> vk::PhysicalDeviceFeatures {
    let mut features = vk::PhysicalDeviceFeatures::default();
    for feature in list {
        feature.enable(&mut features);
    }
    features
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device type
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,

    /// Supported core features
    pub features: vk::PhysicalDeviceFeatures,
    /// Supported device extensions
    pub available_extensions: Vec<String>,
}

impl GpuCapabilities {
    /// Collect capabilities from backend queries.
    pub fn new(
        info: &AdapterInfo,
        memory: &MemoryProperties,
        features: vk::PhysicalDeviceFeatures,
        available_extensions: Vec<String>,
    ) -> Self {
        Self {
            vendor: GpuVendor::from_vendor_id(info.vendor_id),
            device_name: info.name.clone(),
            device_type: info.device_type,
            api_version: info.api_version,
            driver_version: info.driver_version,
            device_local_memory_mb: memory.device_local_bytes() / (1024 * 1024),
            max_compute_workgroup_size: info.max_compute_workgroup_size,
            max_compute_workgroup_invocations: info.max_compute_workgroup_invocations,
            max_sampler_anisotropy: info.max_sampler_anisotropy,
            features,
            available_extensions,
        }
    }

    /// Returns true if the device reports `feature`.
    pub const fn supports(&self, feature: DeviceFeature) -> bool {
        feature.is_supported(&self.features)
    }

    /// Returns true if the device offers extension `name`.
    pub fn has_extension(&self, name: &str) -> bool {
        self.available_extensions.iter().any(|ext| ext == name)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
