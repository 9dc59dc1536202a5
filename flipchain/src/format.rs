// Pixel format helpers and format negotiation
//
// Austin Shafer - 2024
use ash::vk;

use crate::allocator::{
    AllocFlags, AllocFormat, AllocateInfo, AllocateResult, Allocator, FormatFlags,
};
use crate::device::{Device, ImageParams};
use crate::{Result, WsiError};
use utils::log;

use std::sync::Mutex;

/// Build a DRM fourcc code
pub const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const DRM_FORMAT_BIG_ENDIAN: u32 = 1 << 31;

pub const DRM_FORMAT_RGB332: u32 = fourcc_code(b'R', b'G', b'B', b'8');
pub const DRM_FORMAT_BGR233: u32 = fourcc_code(b'B', b'G', b'R', b'8');
pub const DRM_FORMAT_XRGB4444: u32 = fourcc_code(b'X', b'R', b'1', b'2');
pub const DRM_FORMAT_XBGR4444: u32 = fourcc_code(b'X', b'B', b'1', b'2');
pub const DRM_FORMAT_RGBX4444: u32 = fourcc_code(b'R', b'X', b'1', b'2');
pub const DRM_FORMAT_BGRX4444: u32 = fourcc_code(b'B', b'X', b'1', b'2');
pub const DRM_FORMAT_ARGB4444: u32 = fourcc_code(b'A', b'R', b'1', b'2');
pub const DRM_FORMAT_ABGR4444: u32 = fourcc_code(b'A', b'B', b'1', b'2');
pub const DRM_FORMAT_RGBA4444: u32 = fourcc_code(b'R', b'A', b'1', b'2');
pub const DRM_FORMAT_BGRA4444: u32 = fourcc_code(b'B', b'A', b'1', b'2');
pub const DRM_FORMAT_XRGB1555: u32 = fourcc_code(b'X', b'R', b'1', b'5');
pub const DRM_FORMAT_XBGR1555: u32 = fourcc_code(b'X', b'B', b'1', b'5');
pub const DRM_FORMAT_RGBX5551: u32 = fourcc_code(b'R', b'X', b'1', b'5');
pub const DRM_FORMAT_BGRX5551: u32 = fourcc_code(b'B', b'X', b'1', b'5');
pub const DRM_FORMAT_ARGB1555: u32 = fourcc_code(b'A', b'R', b'1', b'5');
pub const DRM_FORMAT_ABGR1555: u32 = fourcc_code(b'A', b'B', b'1', b'5');
pub const DRM_FORMAT_RGBA5551: u32 = fourcc_code(b'R', b'A', b'1', b'5');
pub const DRM_FORMAT_BGRA5551: u32 = fourcc_code(b'B', b'A', b'1', b'5');
pub const DRM_FORMAT_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const DRM_FORMAT_BGR565: u32 = fourcc_code(b'B', b'G', b'1', b'6');
pub const DRM_FORMAT_RGB888: u32 = fourcc_code(b'R', b'G', b'2', b'4');
pub const DRM_FORMAT_BGR888: u32 = fourcc_code(b'B', b'G', b'2', b'4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const DRM_FORMAT_RGBX8888: u32 = fourcc_code(b'R', b'X', b'2', b'4');
pub const DRM_FORMAT_BGRX8888: u32 = fourcc_code(b'B', b'X', b'2', b'4');
pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
pub const DRM_FORMAT_RGBA8888: u32 = fourcc_code(b'R', b'A', b'2', b'4');
pub const DRM_FORMAT_BGRA8888: u32 = fourcc_code(b'B', b'A', b'2', b'4');
pub const DRM_FORMAT_ARGB2101010: u32 = fourcc_code(b'A', b'R', b'3', b'0');
pub const DRM_FORMAT_ABGR2101010: u32 = fourcc_code(b'A', b'B', b'3', b'0');
pub const DRM_FORMAT_ABGR16161616F: u32 = fourcc_code(b'A', b'B', b'4', b'H');

/// One row of the format table
struct FormatEntry {
    drm: u32,
    vk: vk::Format,
    /// Bits per pixel of each plane
    bpp: &'static [u32],
}

const FORMAT_TABLE: &[FormatEntry] = &[
    FormatEntry {
        drm: DRM_FORMAT_ARGB8888,
        vk: vk::Format::B8G8R8A8_UNORM,
        bpp: &[32],
    },
    FormatEntry {
        drm: DRM_FORMAT_ABGR8888,
        vk: vk::Format::R8G8B8A8_UNORM,
        bpp: &[32],
    },
    FormatEntry {
        drm: DRM_FORMAT_ARGB2101010,
        vk: vk::Format::A2R10G10B10_UNORM_PACK32,
        bpp: &[32],
    },
    FormatEntry {
        drm: DRM_FORMAT_ABGR2101010,
        vk: vk::Format::A2B10G10R10_UNORM_PACK32,
        bpp: &[32],
    },
    FormatEntry {
        drm: DRM_FORMAT_RGB565,
        vk: vk::Format::R5G6B5_UNORM_PACK16,
        bpp: &[16],
    },
    FormatEntry {
        drm: DRM_FORMAT_BGR565,
        vk: vk::Format::B5G6R5_UNORM_PACK16,
        bpp: &[16],
    },
    FormatEntry {
        drm: DRM_FORMAT_RGB888,
        vk: vk::Format::B8G8R8_UNORM,
        bpp: &[24],
    },
    FormatEntry {
        drm: DRM_FORMAT_BGR888,
        vk: vk::Format::R8G8B8_UNORM,
        bpp: &[24],
    },
    FormatEntry {
        drm: DRM_FORMAT_ABGR16161616F,
        vk: vk::Format::R16G16B16A16_SFLOAT,
        bpp: &[64],
    },
];

/// sRGB formats share the fourcc of their UNORM twin
const SRGB_FORMAT_TABLE: &[(u32, vk::Format)] = &[
    (DRM_FORMAT_ARGB8888, vk::Format::B8G8R8A8_SRGB),
    (DRM_FORMAT_ABGR8888, vk::Format::R8G8B8A8_SRGB),
    (DRM_FORMAT_RGB888, vk::Format::B8G8R8_SRGB),
    (DRM_FORMAT_BGR888, vk::Format::R8G8B8_SRGB),
];

/// The DRM fourcc for a Vulkan format, 0 if there is none
pub fn vk_to_drm_format(format: vk::Format) -> u32 {
    FORMAT_TABLE
        .iter()
        .find(|e| e.vk == format)
        .map(|e| e.drm)
        .or_else(|| {
            SRGB_FORMAT_TABLE
                .iter()
                .find(|(_, vk)| *vk == format)
                .map(|(drm, _)| *drm)
        })
        .unwrap_or(0)
}

/// The UNORM Vulkan format for a fourcc, UNDEFINED if there is none
pub fn drm_to_vk_format(fourcc: u32) -> vk::Format {
    FORMAT_TABLE
        .iter()
        .find(|e| e.drm == fourcc)
        .map(|e| e.vk)
        .unwrap_or(vk::Format::UNDEFINED)
}

/// The sRGB Vulkan format for a fourcc, UNDEFINED if there is none
pub fn drm_to_vk_srgb_format(fourcc: u32) -> vk::Format {
    SRGB_FORMAT_TABLE
        .iter()
        .find(|(drm, _)| *drm == fourcc)
        .map(|(_, vk)| *vk)
        .unwrap_or(vk::Format::UNDEFINED)
}

/// The number of planes represented by a fourcc format
///
/// Unknown formats have 0 planes.
pub fn drm_fourcc_format_get_num_planes(fourcc: u32) -> u32 {
    drm_format_plane_bpp(fourcc)
        .map(|bpp| bpp.len() as u32)
        .unwrap_or(0)
}

/// Bits per pixel of each plane of `fourcc`, used for linear layouts
pub fn drm_format_plane_bpp(fourcc: u32) -> Option<&'static [u32]> {
    let fourcc = fourcc & !DRM_FORMAT_BIG_ENDIAN;
    match fourcc {
        DRM_FORMAT_RGB332 | DRM_FORMAT_BGR233 => Some(&[8u32][..]),
        DRM_FORMAT_XRGB4444 | DRM_FORMAT_XBGR4444 | DRM_FORMAT_RGBX4444
        | DRM_FORMAT_BGRX4444 | DRM_FORMAT_ARGB4444 | DRM_FORMAT_ABGR4444
        | DRM_FORMAT_RGBA4444 | DRM_FORMAT_BGRA4444 | DRM_FORMAT_XRGB1555
        | DRM_FORMAT_XBGR1555 | DRM_FORMAT_RGBX5551 | DRM_FORMAT_BGRX5551
        | DRM_FORMAT_ARGB1555 | DRM_FORMAT_ABGR1555 | DRM_FORMAT_RGBA5551
        | DRM_FORMAT_BGRA5551 => Some(&[16u32][..]),
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_XBGR8888 | DRM_FORMAT_RGBX8888
        | DRM_FORMAT_BGRX8888 | DRM_FORMAT_RGBA8888 | DRM_FORMAT_BGRA8888 => Some(&[32u32][..]),
        _ => FORMAT_TABLE.iter().find(|e| e.drm == fourcc).map(|e| e.bpp),
    }
}

/// Formats usable for external images of a swapchain
#[derive(Debug, Default, Clone)]
pub struct CompatibleFormats {
    /// Formats we can import allocator memory as
    pub importable: Vec<AllocFormat>,
    /// Formats the driver could export
    pub exportable: Vec<AllocFormat>,
}

/// Find the (format, modifier) pairs usable by both the driver and the
/// display.
///
/// `is_format_supported` is the display side of the check.
pub fn query_compatible_formats(
    dev: &dyn Device,
    params: &ImageParams,
    is_format_supported: &dyn Fn(u32, u64) -> bool,
) -> Result<CompatibleFormats> {
    let fourcc = vk_to_drm_format(params.format);
    if fourcc == 0 {
        log::error!("No DRM format for {:?}", params.format);
        return Err(WsiError::FORMAT_NOT_SUPPORTED);
    }

    let mut ret = CompatibleFormats::default();
    for props in dev.format_modifiers(params.format)?.iter() {
        let modifier = props.drm_format_modifier;
        if !is_format_supported(fourcc, modifier) {
            continue;
        }

        let features = dev.external_memory_features(params, modifier)?;
        let mut format = AllocFormat {
            fourcc: fourcc,
            modifier: modifier,
            flags: FormatFlags::empty(),
        };

        if features.contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE) {
            ret.exportable.push(format);
        }
        if features.contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE) {
            if !props
                .drm_format_modifier_tiling_features
                .contains(vk::FormatFeatureFlags::DISJOINT)
            {
                format.flags |= FormatFlags::NON_DISJOINT;
            }
            ret.importable.push(format);
        }
    }

    log::debug!(
        "Found {} importable and {} exportable formats for {:?}",
        ret.importable.len(),
        ret.exportable.len(),
        params.format
    );
    Ok(ret)
}

/// Lazy format negotiation
///
/// The first allocation of a swapchain picks a format and modifier from
/// the compatible list. Every later allocation of the same swapchain is
/// restricted to that pair.
pub struct FormatCache {
    fc_format: Mutex<Option<AllocFormat>>,
}

impl FormatCache {
    pub fn new() -> Self {
        Self {
            fc_format: Mutex::new(None),
        }
    }

    /// The negotiated format, if one has been chosen yet
    pub fn negotiated(&self) -> Option<AllocFormat> {
        *self.fc_format.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate memory for one image
    ///
    /// `candidates` is only called when no format has been negotiated.
    pub fn allocate(
        &self,
        allocator: &dyn Allocator,
        params: &ImageParams,
        flags: AllocFlags,
        candidates: impl FnOnce() -> Result<Vec<AllocFormat>>,
    ) -> Result<AllocateResult> {
        let mut cached = self.fc_format.lock().unwrap_or_else(|e| e.into_inner());

        let formats = match *cached {
            Some(format) => vec![format],
            None => candidates()?,
        };
        if formats.is_empty() {
            log::error!("No compatible format and modifier pairs for {:?}", params.format);
            return Err(WsiError::FORMAT_NOT_SUPPORTED);
        }

        let info = AllocateInfo {
            formats: &formats,
            width: params.extent.width,
            height: params.extent.height,
            flags: flags,
        };
        let result = allocator.allocate(&info).map_err(|e| {
            log::error!("Failed allocation of DMA Buffer: {}", e);
            WsiError::from(e)
        })?;

        if cached.is_none() {
            log::debug!(
                "Negotiated format {:#x} with modifier {:#x}",
                result.format.fourcc,
                result.format.modifier
            );
            *cached = Some(result.format);
        }
        Ok(result)
    }
}
