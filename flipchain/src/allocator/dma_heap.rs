// DMA-BUF heap allocator
//
// Allocates linear single plane buffers from /dev/dma_heap. This is
// the allocator used for compositor backed swapchains.
//
// Austin Shafer - 2024
use super::{
    AllocError, AllocFlags, AllocFormat, AllocateInfo, AllocateResult, Allocator,
    DRM_FORMAT_MOD_LINEAR, MAX_PLANES,
};
use crate::format::drm_format_plane_bpp;
use utils::log;

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Default alignment of row strides
const MIN_ALIGN: u32 = 64;
/// Maximum image size allowed for each dimension
const MAX_IMAGE_SIZE: u32 = 128000;

pub const SYSTEM_HEAP: &str = "/dev/dma_heap/system";

/// struct dma_heap_allocation_data from linux/dma-heap.h
#[repr(C)]
#[derive(Debug, Default)]
pub struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

nix::ioctl_readwrite!(dma_heap_ioctl_alloc, b'H', 0x0, DmaHeapAllocationData);

/// Layout of a linear image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearLayout {
    pub strides: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    pub num_planes: usize,
    pub size: u64,
}

fn round_up_to_align(size: u32) -> u32 {
    (size + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
}

/// Compute the linear layout for `format`
///
/// Only linear, single plane formats can be laid out.
pub fn linear_layout(
    format: &AllocFormat,
    width: u32,
    height: u32,
) -> std::result::Result<LinearLayout, AllocError> {
    let bpp = drm_format_plane_bpp(format.fourcc).ok_or(AllocError::NotSupported)?;

    // We currently don't support any kind of custom modifiers
    if format.modifier != DRM_FORMAT_MOD_LINEAR {
        return Err(AllocError::NotSupported);
    }
    // No multi-plane format support
    if bpp.len() > 1 {
        return Err(AllocError::NotSupported);
    }

    let mut ret = LinearLayout {
        strides: [0; MAX_PLANES],
        offsets: [0; MAX_PLANES],
        num_planes: bpp.len(),
        size: 0,
    };
    for (plane, bits) in bpp.iter().enumerate() {
        let bytes_per_pixel = bits / 8;
        ret.strides[plane] = round_up_to_align(width * bytes_per_pixel);
        ret.offsets[plane] = ret.size as u32;
        ret.size += ret.strides[plane] as u64 * height as u64;
    }

    Ok(ret)
}

/// An allocator backed by DMA-BUF heaps
pub struct DmaHeapAllocator {
    /// Heap for memory accessible to the window system
    dh_memory: File,
    /// Heap for protected memory, if the platform has one
    dh_protected: Option<File>,
}

impl DmaHeapAllocator {
    /// Open the system heap
    pub fn new() -> std::result::Result<Self, AllocError> {
        Self::open(Path::new(SYSTEM_HEAP), None)
    }

    /// Open specific heaps
    pub fn open(memory: &Path, protected: Option<&Path>) -> std::result::Result<Self, AllocError> {
        let open = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    log::error!("Could not open DMA-BUF heap {}: {}", path.display(), e);
                    AllocError::NoResource
                })
        };

        let memory = open(memory)?;
        let protected = match protected {
            Some(path) => Some(open(path)?),
            None => None,
        };

        Ok(Self::from_files(memory, protected))
    }

    /// Use already opened heaps
    pub fn from_files(memory: File, protected: Option<File>) -> Self {
        Self {
            dh_memory: memory,
            dh_protected: protected,
        }
    }

    fn heap_alloc(heap: &File, size: u64) -> std::result::Result<RawFd, AllocError> {
        let mut data = DmaHeapAllocationData {
            len: size,
            fd_flags: (nix::libc::O_RDWR | nix::libc::O_CLOEXEC) as u32,
            ..Default::default()
        };

        unsafe { dma_heap_ioctl_alloc(heap.as_raw_fd(), &mut data) }.map_err(|e| {
            log::error!("DMA heap allocation of {} bytes failed: {}", size, e);
            AllocError::NoResource
        })?;

        Ok(data.fd as RawFd)
    }
}

impl Allocator for DmaHeapAllocator {
    fn allocate(&self, info: &AllocateInfo) -> std::result::Result<AllocateResult, AllocError> {
        if info.formats.is_empty()
            || info.width < 1
            || info.height < 1
            || info.width > MAX_IMAGE_SIZE
            || info.height > MAX_IMAGE_SIZE
        {
            return Err(AllocError::Invalid);
        }

        let heap = match info.flags.contains(AllocFlags::PROTECTED) {
            true => self.dh_protected.as_ref().ok_or(AllocError::NoResource)?,
            false => &self.dh_memory,
        };

        // Take the first format we can lay out
        let mut err = AllocError::NotSupported;
        let mut selected = None;
        for format in info.formats.iter() {
            match linear_layout(format, info.width, info.height) {
                Ok(layout) => {
                    selected = Some((*format, layout));
                    break;
                }
                Err(e) => err = e,
            }
        }
        let (format, layout) = selected.ok_or(err)?;

        let mut buffer_fds = [-1; MAX_PLANES];
        if !info.flags.contains(AllocFlags::NO_MEMORY) {
            let fd = Self::heap_alloc(heap, layout.size)?;
            // Every plane lives in the one buffer
            for plane_fd in buffer_fds.iter_mut().take(layout.num_planes) {
                *plane_fd = fd;
            }
        }

        Ok(AllocateResult {
            format: format,
            strides: layout.strides,
            offsets: layout.offsets,
            buffer_fds: buffer_fds,
            is_disjoint: false,
        })
    }
}
