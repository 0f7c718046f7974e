//! Vulkan layer for the Prism demos.
//!
//! This crate provides:
//! - Queue family resolution against capability requirements
//! - Instance, physical device selection and logical device management
//! - Buffers, images and explicit memory type selection
//! - Descriptor sets, compute and graphics pipelines
//! - Command recording, fenced submission and ordered teardown
//! - A software [`mock`] backend for running all of the above in tests

pub mod api;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod memory;
pub mod mock;
pub mod pipeline;
pub mod queue;
pub mod sync;
pub mod transfer;
pub mod vulkan;

pub use api::{ClearValue, DeviceApi, ImageDesc, InstanceApi, SamplerDesc};
pub use capabilities::{DeviceFeature, GpuCapabilities, GpuVendor};
pub use command::{
    execute_single_time_commands, record_dispatch, record_draw, CommandPool, DrawCall,
    ExecutableCommandBuffer, RecordingCommandBuffer,
};
pub use context::{Device, DeviceRequirements, GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_sampled_image, write_storage_buffer, write_storage_image, write_uniform_buffer,
    DescriptorPool, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder,
};
pub use error::{ErrorKind, GpuError, Result};
pub use instance::{InstanceConfig, Request};
pub use lifecycle::{Lifecycle, Phase, Stage, Workload};
pub use memory::{find_memory_type, GpuAllocator, GpuBuffer, GpuImage, ImageView, Sampler};
pub use pipeline::{ComputePipeline, Framebuffer, GraphicsPipeline, GraphicsPipelineConfig, RenderPass};
pub use queue::{resolve_queue_families, Capability, Queue, QueueFamilyMap};
pub use sync::{submit_and_wait, Fence, DEFAULT_FENCE_TIMEOUT_NS};
pub use transfer::{layout_transition, LayoutTransition};
