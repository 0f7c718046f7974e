//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A Vulkan call returned a failure code.
    #[error("{call} failed: {result}")]
    ApiCall {
        /// Name of the failing entry point
        call: &'static str,
        /// Code returned by the driver
        result: vk::Result,
    },

    /// The Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// The instance reports no physical devices at all.
    #[error("No physical device found")]
    NoPhysicalDevice,

    /// No physical device satisfies the requested features and queues.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A required instance layer is not available.
    #[error("Required layer not available: {0}")]
    MissingLayer(String),

    /// A required instance or device extension is not available.
    #[error("Required extension not available: {0}")]
    MissingExtension(String),

    /// No memory type matches the resource requirements and property flags.
    #[error("No memory type matches bits {type_bits:#b} with properties {properties:?}")]
    NoMatchingMemoryType {
        /// Allowed memory type bits from the resource requirements
        type_bits: u32,
        /// Requested property flags
        properties: vk::MemoryPropertyFlags,
    },

    /// The layout pair is not in the transition table.
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        /// Current layout
        old: vk::ImageLayout,
        /// Requested layout
        new: vk::ImageLayout,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Host access to memory that is not host-visible.
    #[error("Memory is not host-visible")]
    NotHostVisible,

    /// Host access outside a resource.
    #[error("Range {offset}..{end} out of bounds for size {size}")]
    OutOfBounds {
        /// Start of the requested range
        offset: u64,
        /// End of the requested range
        end: u64,
        /// Size of the resource
        size: u64,
    },

    /// A fence wait exceeded its timeout.
    #[error("Fence not signaled within {timeout_ns} ns")]
    FenceTimeout {
        /// The timeout that elapsed
        timeout_ns: u64,
    },

    /// A descriptor write does not match the set layout.
    #[error("Descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// Queue capabilities could not all be bound to a family.
    #[error("Unresolved queue capabilities: {0:?}")]
    UnresolvedQueues(Vec<crate::queue::Capability>),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Broad classification of a [`GpuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Loader, device, layer or extension availability
    Environment,
    /// Memory, layout and resource access
    Resource,
    /// Fence and queue waits
    Synchronization,
    /// A failing Vulkan call
    Api,
    /// Misuse of the API surface
    Usage,
}

impl GpuError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Loading(_)
            | Self::NoPhysicalDevice
            | Self::NoSuitableDevice
            | Self::MissingLayer(_)
            | Self::MissingExtension(_) => ErrorKind::Environment,
            Self::NoMatchingMemoryType { .. }
            | Self::UnsupportedLayoutTransition { .. }
            | Self::ResourceNotFound(_)
            | Self::NotHostVisible
            | Self::OutOfBounds { .. } => ErrorKind::Resource,
            Self::FenceTimeout { .. } => ErrorKind::Synchronization,
            Self::ApiCall { .. } => ErrorKind::Api,
            Self::DescriptorMismatch(_) | Self::UnresolvedQueues(_) | Self::InvalidState(_) => {
                ErrorKind::Usage
            }
        }
    }
}

/// Attach the failing entry point name to a raw Vulkan result.
pub trait VkResultExt<T> {
    /// Convert into a [`GpuError::ApiCall`] naming `call`.
    fn check(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn check(self, call: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::ApiCall { call, result })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_names_the_call() {
        let raw: std::result::Result<(), vk::Result> =
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = raw.check("vkAllocateMemory").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().starts_with("vkAllocateMemory failed"));
    }

    #[test]
    fn kinds_are_distinct() {
        let no_type = GpuError::NoMatchingMemoryType {
            type_bits: 0b10,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert_eq!(no_type.kind(), ErrorKind::Resource);
        assert_eq!(
            GpuError::FenceTimeout { timeout_ns: 1 }.kind(),
            ErrorKind::Synchronization
        );
        assert_eq!(GpuError::NoSuitableDevice.kind(), ErrorKind::Environment);
        assert_eq!(
            GpuError::UnresolvedQueues(Vec::new()).kind(),
            ErrorKind::Usage
        );
    }
}
