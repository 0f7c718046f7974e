//! Synchronization primitives.

use crate::command::ExecutableCommandBuffer;
use crate::context::Device;
use crate::error::{GpuError, Result};
use crate::queue::Queue;
use ash::vk;
use std::sync::Arc;

/// Fence wait used for workload submissions (100 s).
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 100_000_000_000;

/// An unsignaled fence, destroyed on drop.
pub struct Fence {
    fence: vk::Fence,
    device: Arc<Device>,
}

impl Fence {
    /// Create an unsignaled fence.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let fence = device.api().create_fence()?;
        Ok(Self {
            fence,
            device: device.clone(),
        })
    }

    /// Raw handle.
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Wait for the fence. Returns `Ok(false)` if `timeout_ns` elapsed first.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        self.device.api().wait_for_fence(self.fence, timeout_ns)
    }

    /// Reset the fence to unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.device.api().reset_fence(self.fence)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.api().destroy_fence(self.fence);
    }
}

/// Submit `cmd` to `queue` and block until it completes.
///
/// `queue` must belong to the family of the pool `cmd` was allocated from;
/// otherwise [`GpuError::InvalidState`] is returned before submitting. A
/// fresh fence guards the submission and is destroyed after the wait. If the
/// wait times out or fails the device is idled before the fence is destroyed;
/// a timeout returns [`GpuError::FenceTimeout`].
pub fn submit_and_wait(
    device: &Arc<Device>,
    queue: Queue,
    cmd: &ExecutableCommandBuffer,
    timeout_ns: u64,
) -> Result<()> {
    queue.check_family(cmd.queue_family())?;
    let fence = Fence::new(device)?;
    device
        .api()
        .queue_submit(queue.handle, &[cmd.handle()], fence.handle())?;

    let error = match fence.wait(timeout_ns) {
        Ok(true) => return Ok(()),
        Ok(false) => {
            tracing::error!("Submission did not complete within {} ns", timeout_ns);
            GpuError::FenceTimeout { timeout_ns }
        }
        Err(e) => {
            tracing::error!("Fence wait failed: {}", e);
            e
        }
    };
    if let Err(e) = device.wait_idle() {
        tracing::warn!("Device wait idle before destroying the fence failed: {}", e);
    }
    Err(error)
}
