// Presentation backends
//
// A backend owns the connection to whatever displays our images and
// everything needed to allocate images it can display. The swapchain
// core only ever talks to it through PlatformBackend.
//
// Austin Shafer - 2024
pub mod headless;

#[cfg(feature = "drm")]
pub mod drm;
#[cfg(feature = "wayland")]
pub mod wayland;

use ash::vk;

use crate::allocator::{AllocFlags, Allocator};
use crate::device::{Device, ImageParams};
use crate::external_memory::ExternalMemory;
use crate::format::{CompatibleFormats, FormatCache};
use crate::surface::{PresentTiming, SurfaceProperties};
use crate::swapchain::PendingPresentRequest;
use crate::sync::FenceSync;
use crate::{Result, SwapchainCreateInfo, WsiError};
use utils::log;

use std::sync::{Arc, Mutex};

/// What the core should do while no image is free
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeImageWait {
    /// Sleep until the presentation path retires an image
    Condvar,
    /// The backend made progress on its own, look at the ring again
    Rescan,
}

/// Everything needed to allocate one swapchain image
pub struct ImageCreateParams<'a> {
    pub params: &'a ImageParams,
    /// Protected and compression flags for the allocator
    pub flags: AllocFlags,
    /// The swapchain's negotiated format
    pub formats: &'a FormatCache,
}

/// Per image backend data
///
/// Owned by exactly one swapchain image from allocation until it is
/// handed back through `PlatformBackend::destroy_image`.
pub enum BackendImage {
    Headless(headless::HeadlessImage),
    #[cfg(feature = "drm")]
    Drm(drm::DrmImage),
    #[cfg(feature = "wayland")]
    Wayland(wayland::WaylandImage),
}

impl BackendImage {
    /// The fence armed when this image is queued for presentation
    pub fn present_fence(&self) -> &Mutex<FenceSync> {
        match self {
            BackendImage::Headless(i) => &i.hi_present_fence,
            #[cfg(feature = "drm")]
            BackendImage::Drm(i) => &i.di_present_fence,
            #[cfg(feature = "wayland")]
            BackendImage::Wayland(i) => &i.wi_present_fence,
        }
    }
}

/// The hooks every presentation backend implements
pub trait PlatformBackend: Send + Sync {
    /// One time setup when a swapchain is created
    ///
    /// Returns true if presents should be dispatched from a dedicated
    /// presentation thread.
    fn init_platform(&mut self, info: &SwapchainCreateInfo) -> Result<bool>;

    /// Formats usable by both the driver and this backend's display
    fn get_surface_compatible_formats(&self, params: &ImageParams) -> Result<CompatibleFormats>;

    /// Can the display consume `fourcc` laid out with `modifier`
    fn is_format_supported(&self, fourcc: u32, modifier: u64) -> bool;

    /// Allocate memory for an image, create it, and bind the two
    ///
    /// The returned data carries an unarmed present fence.
    fn allocate_and_bind_image(
        &self,
        create: &ImageCreateParams,
    ) -> Result<(vk::Image, BackendImage)>;

    /// Put an image on screen
    ///
    /// `first_present` is set for the swapchain's first present, which
    /// sets up the display instead of swapping.
    fn present_image(
        &self,
        request: &PendingPresentRequest,
        image: &BackendImage,
        first_present: bool,
    ) -> Result<()>;

    /// Called while no image is free
    fn wait_for_free_image(&self, _timeout_ns: u64) -> Result<FreeImageWait> {
        Ok(FreeImageWait::Condvar)
    }

    /// Release the backend resources of an image. The graphics image
    /// itself is destroyed by the caller afterwards.
    fn destroy_image(&self, _image: vk::Image, data: BackendImage) {
        drop(data);
    }

    /// Arm the image's present fence with the client's wait semaphores
    fn set_present_payload(
        &self,
        image: &BackendImage,
        queue: vk::Queue,
        semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        image
            .present_fence()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_payload(queue, semaphores)
    }

    /// Wait for the client's rendering to an image to finish
    fn wait_present(&self, image: &BackendImage, timeout_ns: u64) -> Result<()> {
        image
            .present_fence()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .wait_payload(timeout_ns)
    }

    fn surface_properties(&self) -> SurfaceProperties;

    /// Past present timings for an image. Backends that don't track
    /// timing report nothing.
    fn present_timing(&self, _image: &BackendImage) -> Vec<PresentTiming> {
        Vec::new()
    }
}

/// Allocate a dmabuf backed image
///
/// The allocator's buffers are imported and bound to a freshly created
/// modifier image. Nothing is leaked if any step fails.
pub fn allocate_dmabuf_image<F>(
    dev: &Arc<dyn Device>,
    allocator: &dyn Allocator,
    create: &ImageCreateParams,
    candidates: F,
) -> Result<(vk::Image, ExternalMemory)>
where
    F: FnOnce() -> Result<CompatibleFormats>,
{
    let alloc = create
        .formats
        .allocate(allocator, create.params, create.flags, || {
            Ok(candidates()?.importable)
        })?;
    let mut memory = ExternalMemory::from_allocation(dev.clone(), alloc)?;
    if !memory.is_valid() {
        log::error!("Allocator returned no usable planes");
        return Err(WsiError::OUT_OF_MEMORY);
    }

    let image = dev.create_image(create.params, Some(&memory.explicit_layout()))?;
    if let Err(e) = memory.import_memory_and_bind_swapchain_image(image) {
        log::error!("Failed to bind external memory: {}", e);
        drop(memory);
        dev.destroy_image(image);
        return Err(e);
    }

    Ok((image, memory))
}
