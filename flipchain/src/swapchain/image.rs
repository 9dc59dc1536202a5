// Swapchain image slots
//
// Austin Shafer - 2024
use ash::vk;
use ash::vk::Handle;

use crate::backend::BackendImage;

use std::sync::Arc;

/// Where an image is in its lifecycle
///
/// `Invalid -> Free -> Acquired -> PendingPresent -> Presented -> Free`
///
/// Images are `Invalid` before they are created and after they are
/// destroyed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Invalid,
    Free,
    Acquired,
    PendingPresent,
    Presented,
}

/// One slot of the ring
///
/// Only touched with the ring lock held.
pub(crate) struct SwapchainImage {
    pub si_image: vk::Image,
    pub si_status: ImageStatus,
    /// Backend data. None until allocated, and for deferred images that
    /// have not been acquired yet.
    pub si_data: Option<Arc<BackendImage>>,
}

impl SwapchainImage {
    pub fn new() -> Self {
        Self {
            si_image: vk::Image::null(),
            si_status: ImageStatus::Invalid,
            si_data: None,
        }
    }

    /// Give the slot its allocation
    pub fn set_allocation(&mut self, image: vk::Image, data: BackendImage) {
        self.si_image = image;
        self.si_data = Some(Arc::new(data));
    }

    pub fn is_allocated(&self) -> bool {
        self.si_data.is_some()
    }
}
