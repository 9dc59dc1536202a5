/// Headless backend
///
/// Nothing is ever displayed. Images get plain device memory and a
/// present finishes as soon as the client's rendering has. This is
/// mostly used for testing.
///
/// Austin Shafer - 2024
use ash::vk;

use super::{BackendImage, ImageCreateParams, PlatformBackend};
use crate::allocator::DRM_FORMAT_MOD_LINEAR;
use crate::device::{Device, ImageParams};
use crate::format::{self, CompatibleFormats};
use crate::surface::{surface_formats_for_fourccs, PresentTiming, SurfaceCapabilities, SurfaceProperties};
use crate::swapchain::PendingPresentRequest;
use crate::sync::FenceSync;
use crate::{Result, SwapchainCreateInfo};
use utils::{log, timing};

use std::sync::{Arc, Mutex};

/// Largest image dimension we advertise
const MAX_DIMENSION: u32 = 16384;
/// Timings kept per image before the oldest are dropped
const MAX_TIMINGS: usize = 16;

const PRESENT_MODES: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];

pub struct HeadlessImage {
    hi_dev: Arc<dyn Device>,
    hi_memory: vk::DeviceMemory,
    pub(crate) hi_present_fence: Mutex<FenceSync>,
    /// Timings not yet collected by the client
    hi_timings: Mutex<Vec<PresentTiming>>,
}

impl HeadlessImage {
    /// Wrap memory allocated for an image
    pub fn new(dev: Arc<dyn Device>, memory: vk::DeviceMemory) -> Result<Self> {
        let fence = FenceSync::new(dev.clone())?;

        Ok(Self {
            hi_dev: dev,
            hi_memory: memory,
            hi_present_fence: Mutex::new(fence),
            hi_timings: Mutex::new(Vec::new()),
        })
    }

    fn record_present(&self, present_id: u64) {
        let now = timing::get_current_millis() as u64 * 1_000_000;
        let mut timings = self.hi_timings.lock().unwrap_or_else(|e| e.into_inner());
        if timings.len() == MAX_TIMINGS {
            timings.remove(0);
        }
        timings.push(PresentTiming {
            present_id: present_id,
            desired_present_time: 0,
            actual_present_time: now,
            earliest_present_time: now,
            present_margin: 0,
        });
    }
}

impl Drop for HeadlessImage {
    fn drop(&mut self) {
        self.hi_dev.free_memory(self.hi_memory);
    }
}

/// A backend with no display
pub struct HeadlessBackend {
    hb_dev: Arc<dyn Device>,
}

impl HeadlessBackend {
    pub fn new(dev: Arc<dyn Device>) -> Self {
        Self { hb_dev: dev }
    }
}

impl PlatformBackend for HeadlessBackend {
    fn init_platform(&mut self, info: &SwapchainCreateInfo) -> Result<bool> {
        log::debug!(
            "Headless swapchain with {} images of {:?}",
            info.image_count,
            info.image_params.extent
        );
        // Presents complete immediately, there is nothing to wait on
        Ok(false)
    }

    fn get_surface_compatible_formats(&self, params: &ImageParams) -> Result<CompatibleFormats> {
        format::query_compatible_formats(&*self.hb_dev, params, &|fourcc, modifier| {
            self.is_format_supported(fourcc, modifier)
        })
    }

    fn is_format_supported(&self, _fourcc: u32, modifier: u64) -> bool {
        modifier == DRM_FORMAT_MOD_LINEAR
    }

    fn allocate_and_bind_image(&self, create: &ImageCreateParams) -> Result<(vk::Image, BackendImage)> {
        let image = self.hb_dev.create_image(create.params, None)?;

        let memory = match self.hb_dev.allocate_image_memory(image) {
            Ok(m) => m,
            Err(e) => {
                log::error!("Failed to allocate headless image memory: {}", e);
                self.hb_dev.destroy_image(image);
                return Err(e);
            }
        };

        match HeadlessImage::new(self.hb_dev.clone(), memory) {
            Ok(data) => Ok((image, BackendImage::Headless(data))),
            Err(e) => {
                self.hb_dev.free_memory(memory);
                self.hb_dev.destroy_image(image);
                Err(e)
            }
        }
    }

    fn present_image(
        &self,
        request: &PendingPresentRequest,
        image: &BackendImage,
        _first_present: bool,
    ) -> Result<()> {
        match image {
            BackendImage::Headless(data) => data.record_present(request.present_id.unwrap_or(0)),
            #[allow(unreachable_patterns)]
            _ => {}
        }
        Ok(())
    }

    fn surface_properties(&self) -> SurfaceProperties {
        SurfaceProperties::new(
            SurfaceCapabilities::common(MAX_DIMENSION),
            surface_formats_for_fourccs(&[
                format::DRM_FORMAT_ARGB8888,
                format::DRM_FORMAT_ABGR8888,
                format::DRM_FORMAT_ARGB2101010,
                format::DRM_FORMAT_ABGR2101010,
                format::DRM_FORMAT_RGB565,
                format::DRM_FORMAT_BGR565,
                format::DRM_FORMAT_ABGR16161616F,
            ]),
            &PRESENT_MODES,
        )
    }

    /// Hands back and forgets the timings recorded since the last call
    fn present_timing(&self, image: &BackendImage) -> Vec<PresentTiming> {
        match image {
            BackendImage::Headless(data) => data
                .hi_timings
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect(),
            #[allow(unreachable_patterns)]
            _ => Vec::new(),
        }
    }
}
