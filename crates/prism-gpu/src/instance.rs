//! Vulkan instance configuration and ownership.

use crate::api::InstanceApi;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Name of the Khronos validation layer.
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// A layer or extension request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Layer or extension name
    pub name: String,
    /// Fail instead of warning when unavailable
    pub required: bool,
}

impl Request {
    /// A request that fails instance creation when unavailable.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    /// A request that is skipped with a warning when unavailable.
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// What a [`Request`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Instance layer
    Layer,
    /// Instance or device extension
    Extension,
}

/// Instance creation settings.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Application name passed to the driver
    pub app_name: String,
    /// Requested Vulkan API version
    pub api_version: u32,
    /// Layer requests
    pub layers: Vec<Request>,
    /// Instance extension requests
    pub extensions: Vec<Request>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        let mut config = Self {
            app_name: "Prism".to_string(),
            api_version: vk::API_VERSION_1_3,
            layers: Vec::new(),
            extensions: Vec::new(),
        };
        config.set_validation(cfg!(debug_assertions));
        config
    }
}

impl InstanceConfig {
    /// Add or remove the best-effort validation layer request.
    pub fn set_validation(&mut self, enable: bool) {
        self.layers.retain(|layer| layer.name != VALIDATION_LAYER);
        if enable {
            self.layers.push(Request::optional(VALIDATION_LAYER));
        }
    }

    /// Returns true if validation is requested.
    pub fn validation_enabled(&self) -> bool {
        self.layers.iter().any(|layer| layer.name == VALIDATION_LAYER)
    }
}

/// Match requests against what the driver offers.
///
/// Returns the names to enable. A missing required request is an error; a
/// missing best-effort request is logged and dropped.
pub fn negotiate(kind: RequestKind, requested: &[Request], available: &[String]) -> Result<Vec<String>> {
    let mut enabled = Vec::with_capacity(requested.len());
    for request in requested {
        if available.iter().any(|name| *name == request.name) {
            if !enabled.contains(&request.name) {
                enabled.push(request.name.clone());
            }
        } else if request.required {
            return Err(match kind {
                RequestKind::Layer => GpuError::MissingLayer(request.name.clone()),
                RequestKind::Extension => GpuError::MissingExtension(request.name.clone()),
            });
        } else {
            tracing::warn!("{:?} {} not available", kind, request.name);
        }
    }
    Ok(enabled)
}

/// Owner of the instance; destroys it when the last reference goes away.
pub struct Instance {
    api: Arc<dyn InstanceApi>,
}

impl Instance {
    /// Take ownership of a created instance.
    pub fn from_api(api: Arc<dyn InstanceApi>) -> Self {
        Self { api }
    }

    /// Backend calls.
    pub fn api(&self) -> &dyn InstanceApi {
        self.api.as_ref()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::trace!("Destroying instance");
        self.api.destroy_instance();
    }
}
