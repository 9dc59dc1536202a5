// External allocator interface
//
// An allocator turns a list of acceptable (format, modifier) pairs and
// a size into one or more dmabuf backed planes.
//
// Austin Shafer - 2024
pub mod dma_heap;
#[cfg(feature = "drm")]
pub mod gbm;

use bitflags::bitflags;
use thiserror::Error;

use crate::WsiError;

use std::os::unix::io::RawFd;

/// The most planes any image can have
pub const MAX_PLANES: usize = 4;

/// Linear layout modifier
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
/// Modifier used when the layout is implicit
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

bitflags! {
    /// Flags controlling a single allocation
    pub struct AllocFlags: u32 {
        /// Allocate from protected memory
        const PROTECTED = 1 << 0;
        /// Only pick a format and compute the layout, allocate nothing
        const NO_MEMORY = 1 << 1;
        /// Ask for the highest fixed rate compression available
        const HIGHEST_FIXED_RATE_COMPRESSION = 1 << 2;
    }
}

bitflags! {
    /// Per format flags
    pub struct FormatFlags: u32 {
        /// The planes of this format must not be placed in separate buffers
        const NON_DISJOINT = 1 << 0;
    }
}

/// A candidate format for an allocation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocFormat {
    /// DRM fourcc code
    pub fourcc: u32,
    pub modifier: u64,
    pub flags: FormatFlags,
}

/// An allocation request
pub struct AllocateInfo<'a> {
    /// Acceptable formats in order of preference
    pub formats: &'a [AllocFormat],
    pub width: u32,
    pub height: u32,
    pub flags: AllocFlags,
}

/// The result of an allocation
///
/// Ownership of every distinct fd in `buffer_fds` passes to the caller.
/// Planes sharing one buffer repeat the same fd. Unused planes are -1.
#[derive(Debug)]
pub struct AllocateResult {
    /// The format that was chosen from the request's list
    pub format: AllocFormat,
    pub strides: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    pub buffer_fds: [RawFd; MAX_PLANES],
    /// The planes live in more than one buffer
    pub is_disjoint: bool,
}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("None of the requested formats can be allocated")]
    NotSupported,
    #[error("Allocator ran out of resources")]
    NoResource,
    #[error("Invalid allocation parameters")]
    Invalid,
}

impl From<AllocError> for WsiError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NotSupported => WsiError::FORMAT_NOT_SUPPORTED,
            _ => WsiError::OUT_OF_MEMORY,
        }
    }
}

/// A memory allocator for swapchain images
pub trait Allocator: Send + Sync {
    fn allocate(&self, info: &AllocateInfo) -> std::result::Result<AllocateResult, AllocError>;
}
