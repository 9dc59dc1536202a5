// Fence based synchronization
//
// Each swapchain image carries a FenceSync which is armed when the
// client queues it for presentation. The presentation path waits on it
// before handing the image to the display.
//
// Austin Shafer - 2024
use ash::vk;
use ash::vk::Handle;

use crate::device::Device;
use crate::{Result, WsiError};
use utils::log;

use std::sync::Arc;

/// A fence with an optional pending payload
pub struct FenceSync {
    fs_dev: Arc<dyn Device>,
    fs_fence: vk::Fence,
    /// A submission signaling this fence has been made
    fs_has_payload: bool,
    /// That submission is known to have completed
    fs_payload_finished: bool,
}

impl FenceSync {
    pub fn new(dev: Arc<dyn Device>) -> Result<Self> {
        let fence = dev.create_fence().map_err(|e| {
            log::error!("Failed to create fence: {}", e);
            e
        })?;

        Ok(Self {
            fs_dev: dev,
            fs_fence: fence,
            fs_has_payload: false,
            fs_payload_finished: false,
        })
    }

    pub fn has_payload(&self) -> bool {
        self.fs_has_payload
    }

    /// Arm the fence
    ///
    /// Submits an empty batch to `queue` which waits on `semaphores` and
    /// signals our fence. Any previous payload must already have been
    /// waited on. A null queue means there is no GPU work to wait for.
    pub fn set_payload(&mut self, queue: vk::Queue, semaphores: &[vk::Semaphore]) -> Result<()> {
        if self.fs_has_payload && !self.fs_payload_finished {
            log::error!("Arming a fence whose previous payload was never waited on");
            return Err(WsiError::INVALID_STATE);
        }

        if queue == vk::Queue::null() {
            if !semaphores.is_empty() {
                log::error!("Wait semaphores were given without a queue to wait on");
                return Err(WsiError::INVALID_STATE);
            }
            self.fs_has_payload = false;
            return Ok(());
        }

        self.fs_dev
            .submit_fence_signal(queue, semaphores, self.fs_fence)?;
        self.fs_has_payload = true;
        self.fs_payload_finished = false;
        Ok(())
    }

    /// Wait for the current payload
    ///
    /// Succeeds immediately if there is no payload or it already
    /// finished. Returns TIMEOUT if it did not finish in time.
    pub fn wait_payload(&mut self, timeout_ns: u64) -> Result<()> {
        if !self.fs_has_payload || self.fs_payload_finished {
            return Ok(());
        }

        match self.fs_dev.wait_fence(self.fs_fence, timeout_ns)? {
            true => {
                self.fs_payload_finished = true;
                Ok(())
            }
            false => Err(WsiError::TIMEOUT),
        }
    }
}

impl Drop for FenceSync {
    fn drop(&mut self) {
        // The fence cannot be destroyed while a submission still uses it
        if let Err(e) = self.wait_payload(u64::MAX) {
            log::error!("Failed waiting for fence payload during teardown: {}", e);
        }
        self.fs_dev.destroy_fence(self.fs_fence);
    }
}
