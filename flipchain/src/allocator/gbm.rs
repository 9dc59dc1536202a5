// GBM allocator
//
// Scanout buffers for the DRM backend come from GBM on the same
// DRM node we are displaying on.
//
// Austin Shafer - 2024
extern crate gbm;

use super::{AllocError, AllocFlags, AllocateInfo, AllocateResult, Allocator, MAX_PLANES};
use utils::log;

use std::convert::TryFrom;
use std::os::unix::io::{IntoRawFd, OwnedFd};
use std::sync::Mutex;

/// Allocates scanout capable buffer objects
pub struct GbmAllocator {
    /// The GBM device on a duplicate of the DRM fd
    ga_gbm: Mutex<gbm::Device<OwnedFd>>,
}

// The gbm device is only ever touched with ga_gbm held
unsafe impl Send for GbmAllocator {}
unsafe impl Sync for GbmAllocator {}

impl GbmAllocator {
    pub fn new(drm_fd: OwnedFd) -> std::result::Result<Self, AllocError> {
        let gbm = gbm::Device::new(drm_fd).map_err(|e| {
            log::error!("Could not create GBM device: {}", e);
            AllocError::NoResource
        })?;

        Ok(Self {
            ga_gbm: Mutex::new(gbm),
        })
    }
}

impl Allocator for GbmAllocator {
    fn allocate(&self, info: &AllocateInfo) -> std::result::Result<AllocateResult, AllocError> {
        let first = info.formats.first().ok_or(AllocError::Invalid)?;
        if info.flags.contains(AllocFlags::PROTECTED) {
            log::error!("GBM allocator cannot allocate protected memory");
            return Err(AllocError::NoResource);
        }

        // GBM picks the modifier, all candidates must share one fourcc
        let fourcc = gbm::Format::try_from(first.fourcc).or(Err(AllocError::NotSupported))?;
        let candidates: Vec<_> = info
            .formats
            .iter()
            .filter(|f| f.fourcc == first.fourcc)
            .collect();

        let gbm = self.ga_gbm.lock().unwrap_or_else(|e| e.into_inner());
        let bo = gbm
            .create_buffer_object_with_modifiers2::<()>(
                info.width,
                info.height,
                fourcc,
                candidates.iter().map(|f| gbm::Modifier::from(f.modifier)),
                gbm::BufferObjectFlags::SCANOUT | gbm::BufferObjectFlags::RENDERING,
            )
            .map_err(|e| {
                log::error!("GBM buffer allocation failed: {}", e);
                AllocError::NoResource
            })?;

        let modifier: u64 = bo.modifier().or(Err(AllocError::NoResource))?.into();
        let format = candidates
            .iter()
            .find(|f| f.modifier == modifier)
            .map(|f| **f)
            .ok_or(AllocError::NotSupported)?;

        let mut ret = AllocateResult {
            format: format,
            strides: [0; MAX_PLANES],
            offsets: [0; MAX_PLANES],
            buffer_fds: [-1; MAX_PLANES],
            is_disjoint: false,
        };
        ret.strides[0] = bo.stride().or(Err(AllocError::NoResource))?;
        ret.offsets[0] = bo.offset(0).or(Err(AllocError::NoResource))?;
        if !info.flags.contains(AllocFlags::NO_MEMORY) {
            // The dmabuf keeps the memory alive once the bo is dropped
            ret.buffer_fds[0] = bo.fd().or(Err(AllocError::NoResource))?.into_raw_fd();
        }

        Ok(ret)
    }
}
