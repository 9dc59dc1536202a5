// Surface properties
//
// What a backend's surface can do: image counts, extents, formats, and
// which present modes can be switched between without recreating the
// swapchain.
// Austin Shafer - 2024
use ash::vk;

use crate::format::{drm_to_vk_format, drm_to_vk_srgb_format};
use utils::log;

/// The most images a swapchain may hold
pub const MAX_SWAPCHAIN_IMAGE_COUNT: u32 = 3;
/// The most modes a single compatibility entry can list
pub const MAX_PRESENT_MODES: usize = 6;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    pub max_image_count: u32,
    /// 0xffffffff in both dimensions means the swapchain decides
    pub current_extent: vk::Extent2D,
    pub min_image_extent: vk::Extent2D,
    pub max_image_extent: vk::Extent2D,
    pub max_image_array_layers: u32,
    pub supported_transforms: vk::SurfaceTransformFlagsKHR,
    pub current_transform: vk::SurfaceTransformFlagsKHR,
    pub supported_composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub supported_usage_flags: vk::ImageUsageFlags,
}

impl SurfaceCapabilities {
    /// The capabilities shared by every backend
    ///
    /// `max_dimension` is the device's largest 2D image dimension.
    pub fn common(max_dimension: u32) -> Self {
        Self {
            min_image_count: 1,
            max_image_count: MAX_SWAPCHAIN_IMAGE_COUNT,
            current_extent: vk::Extent2D {
                width: 0xffffffff,
                height: 0xffffffff,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: max_dimension,
                height: max_dimension,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::INHERIT
                | vk::CompositeAlphaFlagsKHR::OPAQUE
                | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
            supported_usage_flags: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::INPUT_ATTACHMENT,
        }
    }

    /// Is `extent` inside the supported range
    pub fn supports_extent(&self, extent: vk::Extent2D) -> bool {
        extent.width >= self.min_image_extent.width
            && extent.height >= self.min_image_extent.height
            && extent.width <= self.max_image_extent.width
            && extent.height <= self.max_image_extent.height
    }
}

/// The modes one present mode can switch to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentModeCompatibility {
    pub present_mode: vk::PresentModeKHR,
    pub compatible: Vec<vk::PresentModeKHR>,
}

impl PresentModeCompatibility {
    pub fn new(present_mode: vk::PresentModeKHR, compatible: &[vk::PresentModeKHR]) -> Self {
        Self {
            present_mode: present_mode,
            compatible: compatible[..compatible.len().min(MAX_PRESENT_MODES)].to_vec(),
        }
    }
}

/// Present mode compatibility table for a backend
#[derive(Debug, Clone, Default)]
pub struct CompatiblePresentModes {
    cp_table: Vec<PresentModeCompatibility>,
}

impl CompatiblePresentModes {
    pub fn new(table: Vec<PresentModeCompatibility>) -> Self {
        Self { cp_table: table }
    }

    /// Every mode compatible with `mode`
    ///
    /// Querying a mode the surface doesn't support at all is logged and
    /// yields nothing.
    pub fn compatible_modes(&self, mode: vk::PresentModeKHR) -> &[vk::PresentModeKHR] {
        match self.cp_table.iter().find(|c| c.present_mode == mode) {
            Some(c) => &c.compatible,
            None => {
                log::error!(
                    "Querying compatible presentation mode support for unsupported mode {:?}",
                    mode
                );
                &[]
            }
        }
    }

    pub fn is_compatible(&self, a: vk::PresentModeKHR, b: vk::PresentModeKHR) -> bool {
        self.compatible_modes(a).contains(&b)
    }
}

/// Everything a backend reports about its surface
#[derive(Debug, Clone)]
pub struct SurfaceProperties {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub compatibility: CompatiblePresentModes,
}

impl SurfaceProperties {
    /// Properties where every listed mode can switch to every other
    pub fn new(
        capabilities: SurfaceCapabilities,
        formats: Vec<vk::SurfaceFormatKHR>,
        present_modes: &[vk::PresentModeKHR],
    ) -> Self {
        let table = present_modes
            .iter()
            .map(|mode| PresentModeCompatibility::new(*mode, present_modes))
            .collect();

        Self {
            capabilities: capabilities,
            formats: formats,
            present_modes: present_modes.to_vec(),
            compatibility: CompatiblePresentModes::new(table),
        }
    }
}

/// Surface formats for a list of displayable fourccs
///
/// Each fourcc contributes its UNORM format and, if there is one, its
/// sRGB twin.
pub fn surface_formats_for_fourccs(fourccs: &[u32]) -> Vec<vk::SurfaceFormatKHR> {
    let mut ret = Vec::new();
    for fourcc in fourccs.iter() {
        for format in [drm_to_vk_format(*fourcc), drm_to_vk_srgb_format(*fourcc)].iter() {
            let entry = vk::SurfaceFormatKHR {
                format: *format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            };
            if *format != vk::Format::UNDEFINED
                && !ret.iter().any(|f: &vk::SurfaceFormatKHR| f.format == entry.format)
            {
                ret.push(entry);
            }
        }
    }
    ret
}

/// Timing of a past present
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PresentTiming {
    pub present_id: u64,
    pub desired_present_time: u64,
    pub actual_present_time: u64,
    pub earliest_present_time: u64,
    pub present_margin: u64,
}
