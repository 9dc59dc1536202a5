//! # Flipchain: a swapchain presentation engine
//!
//! Flipchain sits between a Vulkan client and the display stack. It
//! owns a fixed ring of presentable images and brokers them between the
//! client, an external memory allocator, and a presentation backend.
//!
//! The backends available are:
//! * `headless` - No display at all. Presented images are retired
//! immediately, which makes it handy for testing.
//! * `drm` - Direct display through DRM KMS. The first present sets the
//! CRTC, every later one page flips and waits for the flip event.
//! * `wayland` - Presents dmabuf backed `wl_buffer`s to a compositor.
//!
//! ## Image lifecycle
//!
//! Every image in the ring moves through the following states:
//!
//! `INVALID -> FREE -> ACQUIRED -> PENDING_PRESENT -> PRESENTED -> FREE`
//!
//! * Acquire an image (`Swapchain::acquire_image`)
//!   * Waits for a FREE image up to the timeout given.
//! * Render to it, then queue it for presentation (`Swapchain::queue_present`)
//!   * The backend either presents it immediately or hands it to the
//!   presentation thread.
//! * Once the next image is on screen, the previous one is retired to FREE.
//!
//! ```no_run
//! use flipchain as fc;
//! use std::sync::Arc;
//!
//! # fn example(dev: Arc<dyn fc::Device>) -> fc::Result<()> {
//! let info = fc::SwapchainCreateInfo::builder()
//!     .extent(640, 480)
//!     .image_count(3)
//!     .build();
//! let backend = Box::new(fc::HeadlessBackend::new(dev.clone()));
//! let swapchain = fc::Swapchain::new(dev, backend, &info)?;
//!
//! let index = swapchain.acquire_image(u64::MAX)?;
//! swapchain.queue_present(fc::PendingPresentRequest::new(index))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Requirements
//!
//! The `Device` implementation handed to Flipchain needs the following
//! Vulkan extensions for the `drm` and `wayland` backends:
//! * VK_EXT_image_drm_format_modifier
//! * VK_KHR_external_memory_fd
//! * VK_EXT_external_memory_dma_buf

// Austin Shafer - 2024

pub mod allocator;
pub mod backend;
pub mod device;
pub mod extensions;
pub mod external_memory;
pub mod format;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;
pub mod wait;

#[cfg(test)]
mod tests;

pub use allocator::{AllocFlags, AllocFormat, Allocator, FormatFlags};
pub use backend::headless::HeadlessBackend;
pub use backend::{BackendImage, PlatformBackend};
pub use device::{Device, ImageParams};
pub use extensions::{CompressionControlInfo, ExtensionKind, FrameBoundary};
pub use surface::{PresentTiming, SurfaceCapabilities};
pub use swapchain::{queue_present_multi, ImageStatus, PendingPresentRequest, Swapchain};

#[cfg(feature = "drm")]
pub use backend::drm::{DrmBackend, DrmConnection};
#[cfg(feature = "wayland")]
pub use backend::wayland::WaylandBackend;

extern crate utils;

use ash::vk;
use thiserror::Error;

/// Flipchain error codes
///
/// These mirror the outcomes a presentation engine hands back to a
/// Vulkan client. `SURFACE_LOST`, `DEVICE_LOST` and
/// `INITIALIZATION_FAILED` are latched by a swapchain and returned
/// from every later call.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WsiError {
    #[error("Timed out waiting for the operation to complete")]
    TIMEOUT,
    #[error("Operation could not complete without blocking")]
    NOT_READY,
    #[error("The surface or display connection has been lost")]
    SURFACE_LOST,
    #[error("The swapchain no longer matches the surface")]
    OUT_OF_DATE,
    #[error("The graphics device has been lost")]
    DEVICE_LOST,
    #[error("Ran out of memory")]
    OUT_OF_MEMORY,
    #[error("No format and modifier are supported by both the driver and the display")]
    FORMAT_NOT_SUPPORTED,
    #[error("The image is not in a valid state for this operation")]
    INVALID_STATE,
    #[error("Failed to initialize the presentation backend")]
    INITIALIZATION_FAILED,
}

impl WsiError {
    /// Does this error put the swapchain in a terminal state
    pub fn is_fatal(&self) -> bool {
        match self {
            WsiError::SURFACE_LOST | WsiError::DEVICE_LOST | WsiError::INITIALIZATION_FAILED => {
                true
            }
            _ => false,
        }
    }
}

impl From<vk::Result> for WsiError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::TIMEOUT => WsiError::TIMEOUT,
            vk::Result::NOT_READY => WsiError::NOT_READY,
            vk::Result::ERROR_SURFACE_LOST_KHR => WsiError::SURFACE_LOST,
            vk::Result::ERROR_OUT_OF_DATE_KHR => WsiError::OUT_OF_DATE,
            vk::Result::ERROR_DEVICE_LOST => WsiError::DEVICE_LOST,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => WsiError::FORMAT_NOT_SUPPORTED,
            vk::Result::ERROR_INITIALIZATION_FAILED => WsiError::INITIALIZATION_FAILED,
            _ => WsiError::OUT_OF_MEMORY,
        }
    }
}

pub type Result<T> = std::result::Result<T, WsiError>;

/// Capability flags resolved by the extension negotiation layer
///
/// These only gate which extensions get created for a swapchain.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExtensionFlags {
    /// VK_KHR_present_id
    pub present_id: bool,
    /// The layer should emit its own frame boundaries
    pub frame_boundary_handling: bool,
    /// VK_EXT_image_compression_control_swapchain
    pub compression_control: bool,
    /// Images must be allocated from protected memory
    pub protected_content: bool,
}

/// Parameters for Swapchain creation.
pub struct SwapchainCreateInfo {
    /// The parameters every image in the ring is created with
    pub image_params: ImageParams,
    /// Number of images in the ring. Fixed for the swapchain's lifetime
    pub image_count: u32,
    /// Present mode to start with
    pub present_mode: vk::PresentModeKHR,
    /// Modes we are allowed to switch to at present time. If empty
    /// only `present_mode` is allowed.
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Don't allocate image memory until the image is first acquired
    pub deferred_allocation: bool,
    pub extensions: ExtensionFlags,
    /// Compression control requested by the client, if any
    pub compression: Option<CompressionControlInfo>,
    /// Override the backend's choice of running a presentation thread
    pub presentation_thread: Option<bool>,
}

impl SwapchainCreateInfo {
    pub fn builder() -> SwapchainCreateInfoBuilder {
        SwapchainCreateInfoBuilder {
            ci: SwapchainCreateInfo {
                image_params: ImageParams::default(),
                image_count: 2,
                present_mode: vk::PresentModeKHR::FIFO,
                present_modes: Vec::new(),
                deferred_allocation: false,
                extensions: ExtensionFlags::default(),
                compression: None,
                presentation_thread: None,
            },
        }
    }

    /// The list of modes queue_present may switch between
    pub(crate) fn allowed_present_modes(&self) -> Vec<vk::PresentModeKHR> {
        if self.present_modes.is_empty() {
            return vec![self.present_mode];
        }
        self.present_modes.clone()
    }
}

/// Implements the builder pattern for easier swapchain creation
pub struct SwapchainCreateInfoBuilder {
    ci: SwapchainCreateInfo,
}

impl SwapchainCreateInfoBuilder {
    pub fn extent(mut self, width: u32, height: u32) -> Self {
        self.ci.image_params.extent = vk::Extent2D { width, height };
        self
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.ci.image_params.format = format;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.ci.image_params.usage = usage;
        self
    }

    pub fn image_count(mut self, count: u32) -> Self {
        self.ci.image_count = count;
        self
    }

    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.ci.present_mode = mode;
        self
    }

    pub fn present_modes(mut self, modes: &[vk::PresentModeKHR]) -> Self {
        self.ci.present_modes = modes.to_vec();
        self
    }

    pub fn deferred_allocation(mut self, deferred: bool) -> Self {
        self.ci.deferred_allocation = deferred;
        self
    }

    pub fn extensions(mut self, flags: ExtensionFlags) -> Self {
        self.ci.extensions = flags;
        self
    }

    pub fn compression(mut self, info: CompressionControlInfo) -> Self {
        self.ci.compression = Some(info);
        self
    }

    pub fn presentation_thread(mut self, enable: bool) -> Self {
        self.ci.presentation_thread = Some(enable);
        self
    }

    pub fn build(self) -> SwapchainCreateInfo {
        self.ci
    }
}
