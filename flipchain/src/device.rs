// Graphics device interface
//
// Everything the swapchain needs from the Vulkan driver goes through
// the Device trait. The ash implementation lives in vulkan.rs.
//
// Austin Shafer - 2024
use ash::vk;

use crate::Result;

use std::os::unix::io::RawFd;

/// The parameters swapchain images are created with
#[derive(Debug, Clone)]
pub struct ImageParams {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub array_layers: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
            array_layers: 1,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_indices: Vec::new(),
        }
    }
}

/// Memory layout for one plane of an externally allocated image
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u64,
    pub row_pitch: u64,
}

/// Explicit DRM modifier layout to create an image over external memory
#[derive(Debug, Clone)]
pub struct ExplicitLayout {
    pub modifier: u64,
    /// One entry per memory plane
    pub planes: Vec<PlaneLayout>,
    pub disjoint: bool,
}

/// One memory binding for `Device::bind_image_memory`
///
/// `plane` is only set for disjoint images.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBinding {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub plane: Option<u32>,
}

/// The aspect used to address memory plane `plane` of a modifier image
pub fn memory_plane_aspect(plane: u32) -> vk::ImageAspectFlags {
    match plane {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        2 => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
        _ => vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
    }
}

/// A graphics driver
///
/// Handles are plain Vulkan handles. Implementations must be usable from
/// both the client threads and the presentation thread.
pub trait Device: Send + Sync {
    /// Create an image. With `layout` the image uses DRM format modifier
    /// tiling over external dmabuf memory, without it the image is a
    /// normal optimal tiled image.
    fn create_image(&self, params: &ImageParams, layout: Option<&ExplicitLayout>)
        -> Result<vk::Image>;

    fn destroy_image(&self, image: vk::Image);

    /// Allocate memory from the first suitable memory type and bind it
    fn allocate_image_memory(&self, image: vk::Image) -> Result<vk::DeviceMemory>;

    /// The DRM format modifiers the driver supports for `format`
    fn format_modifiers(&self, format: vk::Format)
        -> Result<Vec<vk::DrmFormatModifierPropertiesEXT>>;

    /// External memory features for dmabuf images of these parameters
    /// using `modifier`. Empty if the combination is unsupported.
    fn external_memory_features(
        &self,
        params: &ImageParams,
        modifier: u64,
    ) -> Result<vk::ExternalMemoryFeatureFlags>;

    /// Import a dmabuf as device memory for `image`.
    ///
    /// The fd is duplicated, the caller keeps ownership of `fd`.
    fn import_memory_fd(
        &self,
        image: vk::Image,
        fd: RawFd,
        plane: Option<u32>,
    ) -> Result<vk::DeviceMemory>;

    fn bind_image_memory(&self, image: vk::Image, bindings: &[MemoryBinding]) -> Result<()>;

    fn free_memory(&self, memory: vk::DeviceMemory);

    fn create_fence(&self) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Reset `fence` and submit an empty batch to `queue` which waits on
    /// `wait_semaphores` and signals `fence` once they are signaled.
    fn submit_fence_signal(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()>;

    /// Wait for `fence`. Returns false if the timeout expired first.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
}
