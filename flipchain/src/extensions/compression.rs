// Image compression control
//
// Austin Shafer - 2024
use ash::vk;

use crate::allocator::{AllocFlags, MAX_PLANES};
use crate::{Result, WsiError};
use utils::log;

/// Compression parameters the client asked for at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionControlInfo {
    pub flags: vk::ImageCompressionFlagsEXT,
    /// Fixed rate flags for each plane, at most MAX_PLANES
    pub fixed_rate_flags: Vec<vk::ImageCompressionFixedRateFlagsEXT>,
}

impl CompressionControlInfo {
    pub fn new(flags: vk::ImageCompressionFlagsEXT) -> Self {
        Self {
            flags: flags,
            fixed_rate_flags: Vec::new(),
        }
    }

    pub fn with_plane_rates(mut self, rates: &[vk::ImageCompressionFixedRateFlagsEXT]) -> Self {
        self.fixed_rate_flags = rates.to_vec();
        self
    }
}

/// The compression control extension of one swapchain
#[derive(Debug)]
pub struct CompressionControl {
    cc_flags: vk::ImageCompressionFlagsEXT,
    cc_plane_count: usize,
    cc_fixed_rate_flags: [vk::ImageCompressionFixedRateFlagsEXT; MAX_PLANES],
}

impl CompressionControl {
    /// Only created when the capability is enabled and the client
    /// passed parameters.
    pub fn create(enabled: bool, info: Option<&CompressionControlInfo>) -> Result<Option<Self>> {
        let info = match (enabled, info) {
            (true, Some(info)) => info,
            _ => return Ok(None),
        };

        if info.fixed_rate_flags.len() > MAX_PLANES {
            log::error!(
                "Compression control given {} planes, at most {} are supported",
                info.fixed_rate_flags.len(),
                MAX_PLANES
            );
            return Err(WsiError::INVALID_STATE);
        }

        let mut rates = [vk::ImageCompressionFixedRateFlagsEXT::empty(); MAX_PLANES];
        rates[..info.fixed_rate_flags.len()].copy_from_slice(&info.fixed_rate_flags);

        Ok(Some(Self {
            cc_flags: info.flags,
            cc_plane_count: info.fixed_rate_flags.len(),
            cc_fixed_rate_flags: rates,
        }))
    }

    pub fn flags(&self) -> vk::ImageCompressionFlagsEXT {
        self.cc_flags
    }

    pub fn fixed_rate_flags(&self) -> &[vk::ImageCompressionFixedRateFlagsEXT] {
        &self.cc_fixed_rate_flags[..self.cc_plane_count]
    }

    /// Allocation flags implied by the compression request
    pub fn alloc_flags(&self) -> AllocFlags {
        match self
            .cc_flags
            .contains(vk::ImageCompressionFlagsEXT::FIXED_RATE_EXPLICIT)
        {
            true => AllocFlags::HIGHEST_FIXED_RATE_COMPRESSION,
            false => AllocFlags::empty(),
        }
    }
}
