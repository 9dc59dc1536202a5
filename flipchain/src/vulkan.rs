// Vulkan device implementation
//
// This wraps the ash Device handed to us by the client and
// implements the Device trait on top of it.
//
// Austin Shafer - 2024
use ash::extensions::khr;
use ash::vk;
use nix::fcntl::{fcntl, FcntlArg};

use crate::device::{memory_plane_aspect, Device, ExplicitLayout, ImageParams, MemoryBinding};
use crate::{Result, WsiError};
use utils::log;

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::io::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An ash backed graphics device
pub struct VulkanDevice {
    vd_inst: ash::Instance,
    /// the physical device the client created its device on
    vd_pdev: vk::PhysicalDevice,
    vd_dev: ash::Device,
    vd_mem_props: vk::PhysicalDeviceMemoryProperties,
    /// needed for VkGetMemoryFdPropertiesKHR
    vd_external_mem_fd: khr::ExternalMemoryFd,
}

impl VulkanDevice {
    /// Wrap an existing instance and device.
    ///
    /// The device must have been created with the extensions listed in
    /// the crate documentation.
    pub fn new(inst: ash::Instance, pdev: vk::PhysicalDevice, dev: ash::Device) -> Self {
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let loader = khr::ExternalMemoryFd::new(&inst, &dev);

        Self {
            vd_inst: inst,
            vd_pdev: pdev,
            vd_dev: dev,
            vd_mem_props: mem_props,
            vd_external_mem_fd: loader,
        }
    }

    /// Find a memory type that matches the requirements bitmask
    ///
    /// Memory types specify the location and accessability of memory.
    /// We prefer types with all of `flags` but fall back to the first
    /// type allowed by `type_bits`.
    fn find_memory_type_index(
        props: &vk::PhysicalDeviceMemoryProperties,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let allowed = |i: usize| (type_bits >> i) & 1 == 1;
        let types = &props.memory_types[..props.memory_type_count as usize];

        types
            .iter()
            .enumerate()
            .find(|(i, t)| allowed(*i) && t.property_flags.contains(flags))
            .or_else(|| types.iter().enumerate().find(|(i, _)| allowed(*i)))
            .map(|(i, _)| i as u32)
    }
}

impl Device for VulkanDevice {
    fn create_image(
        &self,
        params: &ImageParams,
        layout: Option<&ExplicitLayout>,
    ) -> Result<vk::Image> {
        let plane_layouts: Vec<vk::SubresourceLayout> = layout
            .map(|l| {
                l.planes
                    .iter()
                    .map(|p| {
                        vk::SubresourceLayout::builder()
                            .offset(p.offset)
                            .row_pitch(p.row_pitch)
                            .size(0)
                            .build()
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut drm_create_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(layout.map(|l| l.modifier).unwrap_or(0))
            .plane_layouts(&plane_layouts)
            .build();
        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();

        let mut image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(params.format)
            .extent(vk::Extent3D {
                width: params.extent.width,
                height: params.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(params.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(params.usage)
            .sharing_mode(params.sharing_mode)
            .queue_family_indices(&params.queue_family_indices)
            .flags(params.flags)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        if let Some(layout) = layout {
            let mut flags = params.flags;
            if layout.disjoint {
                flags |= vk::ImageCreateFlags::DISJOINT;
            }
            image_info = image_info
                .flags(flags)
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .push_next(&mut ext_mem_info)
                .push_next(&mut drm_create_info);
        }

        unsafe { self.vd_dev.create_image(&image_info, None) }.map_err(|e| {
            log::error!("Failed to create swapchain image: {:?}", e);
            WsiError::from(e)
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.vd_dev.destroy_image(image, None) };
    }

    fn allocate_image_memory(&self, image: vk::Image) -> Result<vk::DeviceMemory> {
        let reqs = unsafe { self.vd_dev.get_image_memory_requirements(image) };
        let index = Self::find_memory_type_index(
            &self.vd_mem_props,
            reqs.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(WsiError::OUT_OF_MEMORY)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(index);

        unsafe {
            let memory = self.vd_dev.allocate_memory(&alloc_info, None)?;
            if let Err(e) = self.vd_dev.bind_image_memory(image, memory, 0) {
                self.vd_dev.free_memory(memory, None);
                return Err(e.into());
            }
            Ok(memory)
        }
    }

    fn format_modifiers(
        &self,
        format: vk::Format,
    ) -> Result<Vec<vk::DrmFormatModifierPropertiesEXT>> {
        // First get the number of modifiers
        let mut count_list = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut format_props = vk::FormatProperties2::builder().push_next(&mut count_list);
        unsafe {
            self.vd_inst.get_physical_device_format_properties2(
                self.vd_pdev,
                format,
                &mut format_props,
            )
        };

        let count = count_list.drm_format_modifier_count as usize;
        let mut mods = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
        let mut mod_list = vk::DrmFormatModifierPropertiesListEXT {
            drm_format_modifier_count: count as u32,
            p_drm_format_modifier_properties: mods.as_mut_ptr(),
            ..Default::default()
        };
        let mut format_props = vk::FormatProperties2::builder().push_next(&mut mod_list);
        unsafe {
            self.vd_inst.get_physical_device_format_properties2(
                self.vd_pdev,
                format,
                &mut format_props,
            )
        };

        let written = mod_list.drm_format_modifier_count as usize;
        mods.truncate(written);
        Ok(mods)
    }

    fn external_memory_features(
        &self,
        params: &ImageParams,
        modifier: u64,
    ) -> Result<vk::ExternalMemoryFeatureFlags> {
        let mut drm_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::builder()
            .drm_format_modifier(modifier)
            .sharing_mode(params.sharing_mode)
            .queue_family_indices(&params.queue_family_indices);
        let mut ext_info = vk::PhysicalDeviceExternalImageFormatInfo::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let format_info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(params.format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(params.usage)
            .flags(params.flags)
            .push_next(&mut ext_info)
            .push_next(&mut drm_info);

        let mut ext_props = vk::ExternalImageFormatProperties::default();
        let mut props = vk::ImageFormatProperties2::builder().push_next(&mut ext_props);

        let res = unsafe {
            self.vd_inst.get_physical_device_image_format_properties2(
                self.vd_pdev,
                &format_info,
                &mut props,
            )
        };
        match res {
            Ok(()) => Ok(ext_props
                .external_memory_properties
                .external_memory_features),
            // Unsupported combinations are not an error, just filtered out
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => {
                Ok(vk::ExternalMemoryFeatureFlags::empty())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn import_memory_fd(
        &self,
        _image: vk::Image,
        fd: RawFd,
        _plane: Option<u32>,
    ) -> Result<vk::DeviceMemory> {
        let type_bits = unsafe {
            self.vd_external_mem_fd
                .get_memory_fd_properties(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, fd)
        }
        .map_err(|e| {
            log::error!("Error querying file descriptor properties: {:?}", e);
            WsiError::from(e)
        })?
        .memory_type_bits;

        // The first memory type the dmabuf can be imported as
        let index = (0..vk::MAX_MEMORY_TYPES as u32)
            .find(|i| (type_bits >> i) & 1 == 1)
            .ok_or(WsiError::OUT_OF_MEMORY)?;

        // The dmabuf size is the allocation size
        let size = {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut file = File::from(
                borrowed
                    .try_clone_to_owned()
                    .or(Err(WsiError::OUT_OF_MEMORY))?,
            );
            file.seek(SeekFrom::End(0)).map_err(|e| {
                log::error!("Failed to get fd size: {}", e);
                WsiError::OUT_OF_MEMORY
            })?
        };

        // Vulkan takes ownership of the fd on a successful import, so hand
        // it a duplicate
        let dup = match fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(f) => unsafe { OwnedFd::from_raw_fd(f) },
            Err(e) => {
                log::debug!("could not dup fd {:?}", e);
                return Err(WsiError::OUT_OF_MEMORY);
            }
        };

        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(std::os::unix::io::AsRawFd::as_raw_fd(&dup));
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(index)
            .push_next(&mut import_fd_info);

        let memory = unsafe { self.vd_dev.allocate_memory(&alloc_info, None) }.map_err(|e| {
            log::error!("Failed to import device memory: {:?}", e);
            WsiError::from(e)
        })?;
        // Now owned by the driver
        let _ = dup.into_raw_fd();

        Ok(memory)
    }

    fn bind_image_memory(&self, image: vk::Image, bindings: &[MemoryBinding]) -> Result<()> {
        let disjoint = bindings.iter().any(|b| b.plane.is_some());
        if !disjoint {
            let binding = bindings.first().ok_or(WsiError::INVALID_STATE)?;
            return unsafe {
                self.vd_dev
                    .bind_image_memory(image, binding.memory, binding.offset)
            }
            .map_err(WsiError::from);
        }

        let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = bindings
            .iter()
            .map(|b| {
                vk::BindImagePlaneMemoryInfo::builder()
                    .plane_aspect(memory_plane_aspect(b.plane.unwrap_or(0)))
                    .build()
            })
            .collect();
        let bind_infos: Vec<vk::BindImageMemoryInfo> = plane_infos
            .iter_mut()
            .zip(bindings.iter())
            .map(|(plane_info, b)| {
                vk::BindImageMemoryInfo::builder()
                    .image(image)
                    .memory(b.memory)
                    .memory_offset(b.offset)
                    .push_next(plane_info)
                    .build()
            })
            .collect();

        unsafe { self.vd_dev.bind_image_memory2(&bind_infos) }.map_err(WsiError::from)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.vd_dev.free_memory(memory, None) };
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        unsafe { self.vd_dev.create_fence(&info, None) }.map_err(WsiError::from)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.vd_dev.destroy_fence(fence, None) };
    }

    fn submit_fence_signal(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let stages = vec![vk::PipelineStageFlags::BOTTOM_OF_PIPE; wait_semaphores.len()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&stages)
            .build();

        unsafe {
            self.vd_dev.reset_fences(&[fence])?;
            self.vd_dev.queue_submit(queue, &[submit], fence)?;
        }
        Ok(())
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.vd_dev.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
