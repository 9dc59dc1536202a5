// External memory tracking for swapchain images
//
// Each externally allocated image records the dmabuf planes it was
// built from here. The record owns the plane fds and any device
// memory imported from them.
//
// Austin Shafer - 2024
use ash::vk;

use crate::allocator::{AllocateResult, MAX_PLANES};
use crate::device::{Device, ExplicitLayout, MemoryBinding, PlaneLayout};
use crate::format::drm_fourcc_format_get_num_planes;
use crate::{Result, WsiError};
use utils::log;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Count the distinct buffers backing the first `num_planes` planes
///
/// A plane is counted if its fd does not show up again in a later slot,
/// so planes sharing a buffer are counted once.
pub fn count_distinct_memories(fds: &[RawFd; MAX_PLANES], num_planes: usize) -> u32 {
    (0..num_planes.min(MAX_PLANES))
        .filter(|&i| !fds[i + 1..].contains(&fds[i]))
        .count() as u32
}

/// Per image dmabuf plane information
pub struct ExternalMemory {
    em_dev: Arc<dyn Device>,
    /// fd for each plane, -1 for unused planes
    em_buffer_fds: [RawFd; MAX_PLANES],
    /// Owning handles, one per distinct fd above
    em_owned_fds: Vec<OwnedFd>,
    em_strides: [u32; MAX_PLANES],
    em_offsets: [u32; MAX_PLANES],
    em_num_planes: u32,
    em_num_memories: u32,
    em_disjoint: bool,
    em_modifier: u64,
    em_handle_type: vk::ExternalMemoryHandleTypeFlags,
    /// Imported memories, one per distinct buffer
    em_memories: Vec<vk::DeviceMemory>,
}

impl ExternalMemory {
    /// Take ownership of an allocation
    ///
    /// This checks that the allocator's disjoint flag agrees with the
    /// number of distinct buffers it handed back.
    pub fn from_allocation(dev: Arc<dyn Device>, alloc: AllocateResult) -> Result<Self> {
        let num_planes = drm_fourcc_format_get_num_planes(alloc.format.fourcc);

        // Wrap every distinct fd first so nothing leaks on the error path
        let mut owned = Vec::new();
        for (i, fd) in alloc.buffer_fds.iter().enumerate() {
            if *fd >= 0 && !alloc.buffer_fds[..i].contains(fd) {
                owned.push(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }

        let num_memories = match owned.is_empty() {
            // Nothing was allocated
            true => 0,
            false => count_distinct_memories(&alloc.buffer_fds, num_planes as usize),
        };
        if !owned.is_empty() && alloc.is_disjoint != (num_memories > 1) {
            log::error!(
                "Allocator reported disjoint={} but returned {} distinct buffers",
                alloc.is_disjoint,
                num_memories
            );
            return Err(WsiError::OUT_OF_MEMORY);
        }

        Ok(Self {
            em_dev: dev,
            em_buffer_fds: alloc.buffer_fds,
            em_owned_fds: owned,
            em_strides: alloc.strides,
            em_offsets: alloc.offsets,
            em_num_planes: num_planes,
            em_num_memories: num_memories,
            em_disjoint: alloc.is_disjoint,
            em_modifier: alloc.format.modifier,
            em_handle_type: vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            em_memories: Vec::new(),
        })
    }

    pub fn num_planes(&self) -> u32 {
        self.em_num_planes
    }

    pub fn num_memories(&self) -> u32 {
        self.em_num_memories
    }

    pub fn is_disjoint(&self) -> bool {
        self.em_disjoint
    }

    pub fn modifier(&self) -> u64 {
        self.em_modifier
    }

    pub fn handle_type(&self) -> vk::ExternalMemoryHandleTypeFlags {
        self.em_handle_type
    }

    pub fn buffer_fds(&self) -> &[RawFd; MAX_PLANES] {
        &self.em_buffer_fds
    }

    pub fn strides(&self) -> &[u32; MAX_PLANES] {
        &self.em_strides
    }

    pub fn offsets(&self) -> &[u32; MAX_PLANES] {
        &self.em_offsets
    }

    /// Is there backing memory we can use
    pub fn is_valid(&self) -> bool {
        self.em_num_planes > 0 && self.em_buffer_fds[0] >= 0
    }

    /// The layout to create the Vulkan image with
    pub fn explicit_layout(&self) -> ExplicitLayout {
        ExplicitLayout {
            modifier: self.em_modifier,
            planes: (0..self.em_num_planes as usize)
                .map(|p| PlaneLayout {
                    offset: self.em_offsets[p] as u64,
                    row_pitch: self.em_strides[p] as u64,
                })
                .collect(),
            disjoint: self.em_disjoint,
        }
    }

    /// Import every distinct plane buffer as device memory
    pub fn import_plane_memories(&mut self, image: vk::Image) -> Result<()> {
        if !self.is_valid() {
            log::error!("No plane buffers to import");
            return Err(WsiError::INVALID_STATE);
        }

        if !self.em_disjoint {
            let memory = self
                .em_dev
                .import_memory_fd(image, self.em_buffer_fds[0], None)?;
            self.em_memories.push(memory);
            return Ok(());
        }

        let mut memory_plane = 0;
        for plane in 0..self.em_num_planes as usize {
            let fd = self.em_buffer_fds[plane];
            // Only the first plane using a buffer imports it
            if self.em_buffer_fds[..plane].contains(&fd) {
                continue;
            }
            let memory = self
                .em_dev
                .import_memory_fd(image, fd, Some(memory_plane))?;
            self.em_memories.push(memory);
            memory_plane += 1;
        }
        Ok(())
    }

    /// Bind the imported memories to `image`
    ///
    /// Fails with INVALID_STATE if no memory has been imported, which is
    /// the case for images whose memory was not retained.
    pub fn bind_swapchain_image_memory(&self, image: vk::Image) -> Result<()> {
        if self.em_memories.is_empty() {
            log::error!("Binding a swapchain image with no retained memory");
            return Err(WsiError::INVALID_STATE);
        }

        let bindings: Vec<MemoryBinding> = match self.em_disjoint {
            true => self
                .em_memories
                .iter()
                .enumerate()
                .map(|(plane, memory)| MemoryBinding {
                    memory: *memory,
                    offset: self.em_offsets[plane] as u64,
                    plane: Some(plane as u32),
                })
                .collect(),
            false => vec![MemoryBinding {
                memory: self.em_memories[0],
                offset: self.em_offsets[0] as u64,
                plane: None,
            }],
        };

        self.em_dev.bind_image_memory(image, &bindings)
    }

    pub fn import_memory_and_bind_swapchain_image(&mut self, image: vk::Image) -> Result<()> {
        self.import_plane_memories(image)?;
        self.bind_swapchain_image_memory(image)
    }

    /// Raw fds of the distinct buffers, for backends that register them
    /// with the display
    pub fn distinct_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.em_owned_fds.iter().map(|fd| fd.as_raw_fd())
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        for memory in self.em_memories.drain(..) {
            self.em_dev.free_memory(memory);
        }
        // em_owned_fds closes each distinct buffer exactly once
    }
}
