// Present requests
//
// Austin Shafer - 2024
use ash::vk;
use ash::vk::Handle;

use super::Swapchain;
use crate::extensions::FrameBoundary;
use crate::{Result, WsiError};

/// One image queued for presentation
///
/// Consumed exactly once by the presentation path.
#[derive(Debug)]
pub struct PendingPresentRequest {
    pub image_index: u32,
    /// Id reported through the present id extension once on screen
    pub present_id: Option<u64>,
    /// Mode to switch to. Once queued this is the mode the image is
    /// presented with.
    pub present_mode: Option<vk::PresentModeKHR>,
    /// The application's frame boundary. Once queued this is the
    /// boundary submitted with the present, if any.
    pub frame_boundary: Option<FrameBoundary>,
    /// Queue the wait semaphores are waited on from. Null if the client
    /// has no rendering to wait for.
    pub queue: vk::Queue,
    pub wait_semaphores: Vec<vk::Semaphore>,
}

impl PendingPresentRequest {
    pub fn new(image_index: u32) -> Self {
        Self {
            image_index: image_index,
            present_id: None,
            present_mode: None,
            frame_boundary: None,
            queue: vk::Queue::null(),
            wait_semaphores: Vec::new(),
        }
    }

    pub fn present_id(mut self, id: u64) -> Self {
        self.present_id = Some(id);
        self
    }

    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = Some(mode);
        self
    }

    pub fn frame_boundary(mut self, boundary: FrameBoundary) -> Self {
        self.frame_boundary = Some(boundary);
        self
    }

    pub fn wait(mut self, queue: vk::Queue, semaphores: &[vk::Semaphore]) -> Self {
        self.queue = queue;
        self.wait_semaphores = semaphores.to_vec();
        self
    }
}

/// Work items for the presentation thread
pub(crate) enum PresentTask {
    Present(PendingPresentRequest),
    /// Sent after every queued present at teardown
    Exit,
}

/// Order in which failures win when presenting to several swapchains
fn error_priority(err: WsiError) -> u32 {
    match err {
        WsiError::DEVICE_LOST => 3,
        WsiError::SURFACE_LOST => 2,
        WsiError::OUT_OF_DATE => 1,
        _ => 0,
    }
}

/// Present to several swapchains at once
///
/// Every request is attempted. The result is the most severe failure:
/// DEVICE_LOST, then SURFACE_LOST, then OUT_OF_DATE, then the first
/// other error.
pub fn queue_present_multi(presents: Vec<(&Swapchain, PendingPresentRequest)>) -> Result<()> {
    let mut worst: Option<WsiError> = None;

    for (swapchain, request) in presents.into_iter() {
        if let Err(e) = swapchain.queue_present(request) {
            worst = match worst {
                Some(w) if error_priority(w) >= error_priority(e) => Some(w),
                _ => Some(e),
            };
        }
    }

    match worst {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities() {
        assert!(error_priority(WsiError::DEVICE_LOST) > error_priority(WsiError::SURFACE_LOST));
        assert!(error_priority(WsiError::SURFACE_LOST) > error_priority(WsiError::OUT_OF_DATE));
        assert!(error_priority(WsiError::OUT_OF_DATE) > error_priority(WsiError::TIMEOUT));
        assert_eq!(
            error_priority(WsiError::TIMEOUT),
            error_priority(WsiError::INVALID_STATE)
        );
    }
}
