/// DRM backend
///
/// Presents directly to a display through DRM KMS with the atomic
/// API. The first present of a swapchain does a full modeset, every
/// later one flips the primary plane's framebuffer and waits for the
/// flip event.
///
/// Austin Shafer - 2024
pub mod drm_device;
use drm_device::DrmDevice;
mod blob;

extern crate drm;

use ash::vk;
use drm::buffer::{self, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{
    atomic, connector, crtc, framebuffer, plane, property, Device as ControlDevice,
};
use drm::{control, Device as DrmDeviceTrait};

use super::{allocate_dmabuf_image, BackendImage, ImageCreateParams, PlatformBackend};
use crate::allocator::gbm::GbmAllocator;
use crate::allocator::MAX_PLANES;
use crate::device::{Device, ImageParams};
use crate::external_memory::ExternalMemory;
use crate::format::{self, CompatibleFormats};
use crate::surface::{surface_formats_for_fourccs, SurfaceCapabilities, SurfaceProperties};
use crate::swapchain::PendingPresentRequest;
use crate::sync::FenceSync;
use crate::wait;
use crate::{Result, SwapchainCreateInfo, WsiError};
use utils::log;

use std::convert::TryFrom;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

// Constants to use to index for the property handles. We do this
// instead of using a string search hashmap repeatedly.
const ACTIVE: usize = 0;
const FB_ID: usize = 1;
const CRTC_ID: usize = 2;
const SRC_X: usize = 3;
const SRC_Y: usize = 4;
const SRC_W: usize = 5;
const SRC_H: usize = 6;
const CRTC_X: usize = 7;
const CRTC_Y: usize = 8;
const CRTC_W: usize = 9;
const CRTC_H: usize = 10;
const MODE_ID: usize = 11;
const CONN_CRTC_ID: usize = 12;

/// A display output opened through DRM
///
/// One connection drives one connector. It is shared by every swapchain
/// presenting to that connector and closed once the last one is gone.
pub struct DrmConnection {
    /// Held for the duration of one present dispatch
    dc_drm: Mutex<DrmDevice>,
    dc_fd: RawFd,
    dc_conn: connector::Info,
    dc_crtc: crtc::Info,
    dc_mode: control::Mode,
    /// Primary plane on our CRTC
    dc_plane: plane::Handle,
    /// Indexed by the constants above
    dc_props: Vec<property::Handle>,
    /// (fourcc, modifier) pairs the plane can scan out
    dc_formats: Vec<(u32, u64)>,
}

/// Find the primary plane usable with `crtc`
fn find_primary_plane(
    drm: &DrmDevice,
    res: &control::ResourceHandles,
    crtc: crtc::Handle,
) -> Result<plane::Handle> {
    let planes = drm.plane_handles().or(Err(WsiError::SURFACE_LOST))?;

    planes
        .iter()
        .copied()
        .find(|&plane| {
            let plane_prop_list = match drm.get_properties(plane) {
                Ok(props) => props,
                Err(_) => return false,
            };
            let info = match drm.get_plane(plane) {
                Ok(info) => info,
                Err(_) => return false,
            };

            // verify this plane supports our crtc
            let compatible_crtcs = res.filter_crtcs(info.possible_crtcs());
            if !compatible_crtcs.contains(&crtc) {
                return false;
            }

            for (&id, &val) in plane_prop_list.iter() {
                if let Ok(prop_info) = drm.get_property(id) {
                    if prop_info
                        .name()
                        .to_str()
                        .map(|x| x == "type")
                        .unwrap_or(false)
                    {
                        return val == (drm::control::PlaneType::Primary as u32).into();
                    }
                }
            }
            false
        })
        .ok_or_else(|| {
            log::error!("No primary plane found for CRTC {:?}", crtc);
            WsiError::SURFACE_LOST
        })
}

/// Look up the property handles we commit with
fn get_property_handles(
    drm: &DrmDevice,
    conn: connector::Handle,
    crtc: crtc::Handle,
    plane: plane::Handle,
) -> Result<Vec<property::Handle>> {
    let plane_props = drm
        .get_properties(plane)
        .or(Err(WsiError::SURFACE_LOST))?
        .as_hashmap(drm)
        .or(Err(WsiError::SURFACE_LOST))?;
    let con_props = drm
        .get_properties(conn)
        .or(Err(WsiError::SURFACE_LOST))?
        .as_hashmap(drm)
        .or(Err(WsiError::SURFACE_LOST))?;
    let crtc_props = drm
        .get_properties(crtc)
        .or(Err(WsiError::SURFACE_LOST))?
        .as_hashmap(drm)
        .or(Err(WsiError::SURFACE_LOST))?;

    let lookup = |map: &std::collections::HashMap<String, property::Info>, name: &str| {
        map.get(name).map(|p| p.handle()).ok_or_else(|| {
            log::error!("DRM object is missing the {} property", name);
            WsiError::SURFACE_LOST
        })
    };

    // This order must follow the order of the similarly named constants
    Ok(vec![
        lookup(&crtc_props, "ACTIVE")?,
        lookup(&plane_props, "FB_ID")?,
        lookup(&plane_props, "CRTC_ID")?,
        lookup(&plane_props, "SRC_X")?,
        lookup(&plane_props, "SRC_Y")?,
        lookup(&plane_props, "SRC_W")?,
        lookup(&plane_props, "SRC_H")?,
        lookup(&plane_props, "CRTC_X")?,
        lookup(&plane_props, "CRTC_Y")?,
        lookup(&plane_props, "CRTC_W")?,
        lookup(&plane_props, "CRTC_H")?,
        lookup(&crtc_props, "MODE_ID")?,
        lookup(&con_props, "CRTC_ID")?,
    ])
}

impl DrmConnection {
    /// Open a DRM node and take its first connected connector
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let drm = DrmDevice::open(path).map_err(|e| {
            log::error!("{:#}", e);
            WsiError::INITIALIZATION_FAILED
        })?;
        Self::from_device(drm)
    }

    /// Like `open` but from a device number
    pub fn from_dev_t(major: i64, minor: i64) -> Result<Arc<Self>> {
        let drm = DrmDevice::from_dev_t(major, minor).map_err(|e| {
            log::error!("{:#}", e);
            WsiError::INITIALIZATION_FAILED
        })?;
        Self::from_device(drm)
    }

    fn from_device(drm: DrmDevice) -> Result<Arc<Self>> {
        if let Ok(0) = drm.get_driver_capability(drm::DriverCapability::AddFB2Modifiers) {
            log::error!("DRM driver does not support the AddFB2Modifiers capability");
            return Err(WsiError::INITIALIZATION_FAILED);
        }

        let res = drm.resource_handles().or(Err(WsiError::INITIALIZATION_FAILED))?;
        let conn = res
            .connectors()
            .iter()
            .flat_map(|con| drm.get_connector(*con, true))
            .find(|i| i.state() == connector::State::Connected)
            .ok_or_else(|| {
                log::error!("No available DRM connectors found");
                WsiError::SURFACE_LOST
            })?;

        // Default to the first CRTC available
        let crtc = res
            .crtcs()
            .iter()
            .flat_map(|crtc| drm.get_crtc(*crtc))
            .next()
            .ok_or(WsiError::SURFACE_LOST)?;

        // Prefer the connector's preferred mode, otherwise the first
        let mode = conn
            .modes()
            .iter()
            .find(|m| m.mode_type().contains(control::ModeTypeFlags::PREFERRED))
            .or_else(|| conn.modes().first())
            .copied()
            .ok_or_else(|| {
                log::error!("Connector has no modes");
                WsiError::SURFACE_LOST
            })?;

        let plane = find_primary_plane(&drm, &res, crtc.handle())?;
        let props = get_property_handles(&drm, conn.handle(), crtc.handle(), plane)?;
        let formats = blob::get_plane_formats(&drm, plane)?;

        log::debug!(
            "Using DRM connector {:?} with mode {:?}",
            conn.handle(),
            mode.size()
        );
        Ok(Arc::new(Self {
            dc_fd: drm.raw_fd(),
            dc_drm: Mutex::new(drm),
            dc_conn: conn,
            dc_crtc: crtc,
            dc_mode: mode,
            dc_plane: plane,
            dc_props: props,
            dc_formats: formats,
        }))
    }

    fn lock(&self) -> MutexGuard<DrmDevice> {
        self.dc_drm.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolution of the mode we drive
    pub fn extent(&self) -> vk::Extent2D {
        let (width, height) = self.dc_mode.size();
        vk::Extent2D {
            width: width as u32,
            height: height as u32,
        }
    }

    pub fn supports_format(&self, fourcc: u32, modifier: u64) -> bool {
        self.dc_formats.contains(&(fourcc, modifier))
    }

    /// Distinct fourccs the plane accepts
    pub fn fourccs(&self) -> Vec<u32> {
        let mut ret: Vec<u32> = Vec::new();
        for (fourcc, _) in self.dc_formats.iter() {
            if !ret.contains(fourcc) {
                ret.push(*fourcc);
            }
        }
        ret
    }

    /// Full modeset showing `fb`
    ///
    /// This blocks until the mode is applied. On many setups this
    /// requires DRM master.
    fn commit_mode(&self, drm: &DrmDevice, fb: framebuffer::Handle) -> Result<()> {
        let (width, height) = self.dc_mode.size();
        let crtc = self.dc_crtc.handle();
        let plane = self.dc_plane;

        let blob = drm.create_property_blob(&self.dc_mode).map_err(|e| {
            log::error!("Failed to create mode blob: {}", e);
            WsiError::SURFACE_LOST
        })?;

        let mut req = atomic::AtomicModeReq::new();
        req.add_property(
            self.dc_conn.handle(),
            self.dc_props[CONN_CRTC_ID],
            property::Value::CRTC(Some(crtc)),
        );
        req.add_property(crtc, self.dc_props[MODE_ID], blob);
        req.add_property(crtc, self.dc_props[ACTIVE], property::Value::Boolean(true));
        req.add_property(
            plane,
            self.dc_props[FB_ID],
            property::Value::Framebuffer(Some(fb)),
        );
        req.add_property(
            plane,
            self.dc_props[CRTC_ID],
            property::Value::CRTC(Some(crtc)),
        );
        req.add_property(plane, self.dc_props[SRC_X], property::Value::UnsignedRange(0));
        req.add_property(plane, self.dc_props[SRC_Y], property::Value::UnsignedRange(0));
        req.add_property(
            plane,
            self.dc_props[SRC_W],
            property::Value::UnsignedRange((width as u64) << 16),
        );
        req.add_property(
            plane,
            self.dc_props[SRC_H],
            property::Value::UnsignedRange((height as u64) << 16),
        );
        req.add_property(plane, self.dc_props[CRTC_X], property::Value::SignedRange(0));
        req.add_property(plane, self.dc_props[CRTC_Y], property::Value::SignedRange(0));
        req.add_property(
            plane,
            self.dc_props[CRTC_W],
            property::Value::UnsignedRange(width as u64),
        );
        req.add_property(
            plane,
            self.dc_props[CRTC_H],
            property::Value::UnsignedRange(height as u64),
        );

        drm.atomic_commit(control::AtomicCommitFlags::ALLOW_MODESET, req)
            .map_err(|e| {
                log::error!("Failed to set the display mode: {}", e);
                WsiError::SURFACE_LOST
            })
    }

    /// Flip the primary plane to `fb` and wait for the flip to land
    fn flip(&self, drm: &DrmDevice, fb: framebuffer::Handle) -> Result<()> {
        let mut req = atomic::AtomicModeReq::new();
        req.add_property(
            self.dc_plane,
            self.dc_props[FB_ID],
            property::Value::Framebuffer(Some(fb)),
        );

        drm.atomic_commit(
            control::AtomicCommitFlags::NONBLOCK | control::AtomicCommitFlags::PAGE_FLIP_EVENT,
            req,
        )
        .map_err(|e| {
            log::error!("Page flip failed: {}", e);
            WsiError::SURFACE_LOST
        })?;

        let crtc = self.dc_crtc.handle();
        wait::wait_for_completion(self.dc_fd, "page flip", || {
            let events = drm.receive_events().map_err(|e| {
                log::error!("Failed to get DRM events: {:?}", e);
                WsiError::SURFACE_LOST
            })?;

            let mut found = false;
            for ev in events {
                if let control::Event::PageFlip(flip) = ev {
                    found |= flip.crtc == crtc;
                }
            }
            Ok(found)
        })
    }
}

/// Describes an imported dmabuf to drm-rs
struct DmabufFramebuffer {
    df_size: (u32, u32),
    df_format: DrmFourcc,
    df_modifier: DrmModifier,
    df_handles: [Option<buffer::Handle>; MAX_PLANES],
    df_pitches: [u32; MAX_PLANES],
    df_offsets: [u32; MAX_PLANES],
}

impl PlanarBuffer for DmabufFramebuffer {
    fn size(&self) -> (u32, u32) {
        self.df_size
    }

    fn format(&self) -> DrmFourcc {
        self.df_format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        Some(self.df_modifier)
    }

    fn pitches(&self) -> [u32; 4] {
        self.df_pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.df_handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.df_offsets
    }
}

/// A scanout image
pub struct DrmImage {
    di_conn: Arc<DrmConnection>,
    di_fb: framebuffer::Handle,
    /// GEM handles of the imported dmabufs, one per distinct buffer
    di_gem: Vec<buffer::Handle>,
    di_memory: ExternalMemory,
    pub(crate) di_present_fence: Mutex<FenceSync>,
}

impl DrmImage {
    pub fn memory(&self) -> &ExternalMemory {
        &self.di_memory
    }
}

impl Drop for DrmImage {
    fn drop(&mut self) {
        let drm = self.di_conn.lock();
        if let Err(e) = drm.destroy_framebuffer(self.di_fb) {
            log::error!("Failed to destroy DRM framebuffer: {}", e);
        }
        close_gem_handles(&drm, &self.di_gem);
    }
}

fn close_gem_handles(drm: &DrmDevice, handles: &[buffer::Handle]) {
    for handle in handles.iter() {
        if let Err(e) = drm.close_buffer(*handle) {
            log::error!("Failed to close GEM handle: {}", e);
        }
    }
}

/// A backend presenting through a DRM connection
pub struct DrmBackend {
    db_dev: Arc<dyn Device>,
    db_conn: Arc<DrmConnection>,
    /// Created in init_platform
    db_allocator: Option<GbmAllocator>,
}

impl DrmBackend {
    pub fn new(dev: Arc<dyn Device>, conn: Arc<DrmConnection>) -> Self {
        Self {
            db_dev: dev,
            db_conn: conn,
            db_allocator: None,
        }
    }

    /// Register the image's planes with DRM
    ///
    /// Returns the framebuffer and the GEM handles it holds.
    fn create_framebuffer(
        &self,
        params: &ImageParams,
        memory: &ExternalMemory,
        fourcc: u32,
    ) -> Result<(framebuffer::Handle, Vec<buffer::Handle>)> {
        let drm = self.db_conn.lock();
        let format = DrmFourcc::try_from(fourcc).or(Err(WsiError::FORMAT_NOT_SUPPORTED))?;

        let mut gem = Vec::new();
        let mut handles = [None; MAX_PLANES];
        for plane in 0..memory.num_planes() as usize {
            let fd = memory.buffer_fds()[plane];
            // Shared buffers import to the same handle
            let handle = match drm.prime_fd_to_buffer(unsafe { BorrowedFd::borrow_raw(fd) }) {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("Failed to import dmabuf into DRM: {}", e);
                    close_gem_handles(&drm, &gem);
                    return Err(WsiError::OUT_OF_MEMORY);
                }
            };
            if !gem.contains(&handle) {
                gem.push(handle);
            }
            handles[plane] = Some(handle);
        }

        let desc = DmabufFramebuffer {
            df_size: (params.extent.width, params.extent.height),
            df_format: format,
            df_modifier: DrmModifier::from(memory.modifier()),
            df_handles: handles,
            df_pitches: *memory.strides(),
            df_offsets: *memory.offsets(),
        };

        match drm.add_planar_framebuffer(&desc, control::FbCmd2Flags::MODIFIERS) {
            Ok(fb) => Ok((fb, gem)),
            Err(e) => {
                log::error!("Failed to create DRM framebuffer: {}", e);
                close_gem_handles(&drm, &gem);
                Err(WsiError::OUT_OF_MEMORY)
            }
        }
    }
}

impl PlatformBackend for DrmBackend {
    fn init_platform(&mut self, info: &SwapchainCreateInfo) -> Result<bool> {
        let extent = self.db_conn.extent();
        if info.image_params.extent.width != extent.width
            || info.image_params.extent.height != extent.height
        {
            log::error!(
                "Swapchain extent {:?} does not match the display mode {:?}",
                info.image_params.extent,
                extent
            );
            return Err(WsiError::OUT_OF_DATE);
        }

        let fd = self.db_conn.lock().dup_fd().map_err(|e| {
            log::error!("{:#}", e);
            WsiError::INITIALIZATION_FAILED
        })?;
        self.db_allocator =
            Some(GbmAllocator::new(fd).or(Err(WsiError::INITIALIZATION_FAILED))?);

        // Waiting for flip events blocks, so do it off the client's thread
        Ok(true)
    }

    fn get_surface_compatible_formats(&self, params: &ImageParams) -> Result<CompatibleFormats> {
        format::query_compatible_formats(&*self.db_dev, params, &|fourcc, modifier| {
            self.is_format_supported(fourcc, modifier)
        })
    }

    fn is_format_supported(&self, fourcc: u32, modifier: u64) -> bool {
        self.db_conn.supports_format(fourcc, modifier)
    }

    fn allocate_and_bind_image(&self, create: &ImageCreateParams) -> Result<(vk::Image, BackendImage)> {
        let allocator = self.db_allocator.as_ref().ok_or(WsiError::INVALID_STATE)?;
        let (image, memory) = allocate_dmabuf_image(&self.db_dev, allocator, create, || {
            self.get_surface_compatible_formats(create.params)
        })?;

        let fourcc = create
            .formats
            .negotiated()
            .map(|f| f.fourcc)
            .unwrap_or_else(|| format::vk_to_drm_format(create.params.format));
        let data = FenceSync::new(self.db_dev.clone()).and_then(|fence| {
            let (fb, gem) = self.create_framebuffer(create.params, &memory, fourcc)?;
            Ok(DrmImage {
                di_conn: self.db_conn.clone(),
                di_fb: fb,
                di_gem: gem,
                di_memory: memory,
                di_present_fence: Mutex::new(fence),
            })
        });

        match data {
            Ok(data) => Ok((image, BackendImage::Drm(data))),
            Err(e) => {
                self.db_dev.destroy_image(image);
                Err(e)
            }
        }
    }

    fn present_image(
        &self,
        _request: &PendingPresentRequest,
        image: &BackendImage,
        first_present: bool,
    ) -> Result<()> {
        let fb = match image {
            BackendImage::Drm(data) => data.di_fb,
            _ => return Err(WsiError::INVALID_STATE),
        };

        // Mode setting needs the connection to ourselves
        let drm = self.db_conn.lock();
        match first_present {
            true => self.db_conn.commit_mode(&drm, fb),
            false => self.db_conn.flip(&drm, fb),
        }
    }

    fn surface_properties(&self) -> SurfaceProperties {
        let extent = self.db_conn.extent();
        let mut caps = SurfaceCapabilities::common(extent.width.max(extent.height));
        caps.current_extent = extent;
        caps.min_image_extent = extent;
        caps.max_image_extent = extent;

        SurfaceProperties::new(
            caps,
            surface_formats_for_fourccs(&self.db_conn.fourccs()),
            &[vk::PresentModeKHR::FIFO],
        )
    }
}
