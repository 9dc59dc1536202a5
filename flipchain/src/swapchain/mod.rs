// The swapchain core
//
// A fixed ring of images shared between the client and a presentation
// backend. Clients acquire FREE images and queue them for presentation,
// the presentation path puts them on screen and retires the image that
// was previously displayed.
//
// Presents are either dispatched on the calling thread or handed to a
// presentation thread, depending on whether the backend's completion
// wait blocks.
//
// Austin Shafer - 2024
mod image;
mod present;

pub use image::ImageStatus;
pub use present::{queue_present_multi, PendingPresentRequest};

use ash::vk;
use ash::vk::Handle;

use crate::allocator::{AllocFlags, AllocFormat};
use crate::backend::{BackendImage, FreeImageWait, ImageCreateParams, PlatformBackend};
use crate::device::{Device, ImageParams};
use crate::extensions::{frame_boundary, ExtensionTable};
use crate::format::FormatCache;
use crate::surface::{PresentTiming, SurfaceCapabilities};
use crate::{Result, SwapchainCreateInfo, WsiError};
use image::SwapchainImage;
use present::PresentTask;
use utils::{log, timing};

use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Everything guarded by the ring lock
struct RingState {
    rs_images: Vec<SwapchainImage>,
    /// Latched fatal error. Every later operation fails with it.
    rs_error: Option<WsiError>,
    /// Has anything been presented yet
    rs_presented: bool,
    rs_present_mode: vk::PresentModeKHR,
    rs_destroyed: bool,
    /// Client calls using image data outside the ring lock
    rs_in_flight: u32,
}

impl RingState {
    fn find_free(&self) -> Option<usize> {
        self.rs_images
            .iter()
            .position(|i| i.si_status == ImageStatus::Free)
    }

    /// Latch a fatal error. Non fatal errors reaching here mean the
    /// surface is no longer usable.
    fn latch_error(&mut self, err: WsiError) -> WsiError {
        let err = match err.is_fatal() {
            true => err,
            false => WsiError::SURFACE_LOST,
        };
        if self.rs_error.is_none() {
            self.rs_error = Some(err);
        }
        err
    }

    /// Retire the previously displayed image and mark `index` as the
    /// one on screen
    fn retire_and_present(&mut self, index: usize) {
        if let Some(prev) = self
            .rs_images
            .iter_mut()
            .find(|i| i.si_status == ImageStatus::Presented)
        {
            prev.si_status = ImageStatus::Free;
        }
        self.rs_images[index].si_status = ImageStatus::Presented;
        self.rs_presented = true;
    }
}

/// Holds off teardown while a client call uses an image without the
/// ring lock held
struct InFlight<'a> {
    if_shared: &'a SwapchainShared,
}

impl<'a> InFlight<'a> {
    fn new(shared: &'a SwapchainShared, ring: &mut RingState) -> Self {
        ring.rs_in_flight += 1;
        Self { if_shared: shared }
    }
}

impl<'a> Drop for InFlight<'a> {
    fn drop(&mut self) {
        let mut ring = self.if_shared.lock_ring();
        ring.rs_in_flight -= 1;
        self.if_shared.ss_free_cond.notify_all();
    }
}

/// State shared with the presentation thread
struct SwapchainShared {
    ss_dev: Arc<dyn Device>,
    ss_backend: Box<dyn PlatformBackend>,
    ss_ring: Mutex<RingState>,
    /// Signaled whenever an image is retired, an error is latched or a
    /// client call lets go of an image
    ss_free_cond: Condvar,
    /// Only one present is dispatched at a time
    ss_dispatch: Mutex<()>,
    ss_extensions: ExtensionTable,
    ss_formats: FormatCache,
    ss_params: ImageParams,
    ss_alloc_flags: AllocFlags,
    /// Modes queue_present may switch between
    ss_present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainShared {
    fn lock_ring(&self) -> MutexGuard<RingState> {
        self.ss_ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_image(&self) -> Result<(vk::Image, BackendImage)> {
        self.ss_backend.allocate_and_bind_image(&ImageCreateParams {
            params: &self.ss_params,
            flags: self.ss_alloc_flags,
            formats: &self.ss_formats,
        })
    }

    /// Put one queued image on screen
    fn dispatch(&self, request: PendingPresentRequest) -> Result<()> {
        let _dispatch = self.ss_dispatch.lock().unwrap_or_else(|e| e.into_inner());
        let index = request.image_index as usize;

        let (data, first_present) = {
            let ring = self.lock_ring();
            if ring.rs_destroyed {
                return Err(WsiError::INVALID_STATE);
            }
            if let Some(err) = ring.rs_error {
                return Err(err);
            }
            let data = ring.rs_images[index]
                .si_data
                .clone()
                .ok_or(WsiError::INVALID_STATE)?;
            (data, !ring.rs_presented)
        };

        let res = self
            .ss_backend
            .wait_present(&data, u64::MAX)
            .and_then(|_| {
                self.ss_backend
                    .present_image(&request, &data, first_present)
            });
        drop(data);

        let mut ring = self.lock_ring();
        if ring.rs_destroyed {
            // Teardown owns the slots now
            self.ss_free_cond.notify_all();
            return res;
        }
        if let Err(e) = res {
            log::error!("Presenting image {} failed: {}", index, e);
            let err = ring.latch_error(e);
            self.ss_free_cond.notify_all();
            return Err(err);
        }

        ring.retire_and_present(index);
        if let (Some(tracker), Some(id)) = (self.ss_extensions.present_id(), request.present_id) {
            tracker.set_present_id(id);
        }
        self.ss_free_cond.notify_all();
        Ok(())
    }
}

/// The presentation thread and its queue
struct PresentThread {
    pt_tx: mpsc::Sender<PresentTask>,
    pt_handle: JoinHandle<()>,
}

/// Presentation thread main loop
///
/// Presents are dispatched in the order they were queued until we are
/// told to exit.
fn present_thread(shared: Arc<SwapchainShared>, rx: mpsc::Receiver<PresentTask>) {
    log::debug!("Presentation thread started");
    while let Ok(task) = rx.recv() {
        match task {
            PresentTask::Present(request) => {
                // Failures are latched on the swapchain for the client to see
                if let Err(e) = shared.dispatch(request) {
                    log::error!("Presentation thread failed to present: {}", e);
                }
            }
            PresentTask::Exit => break,
        }
    }
    log::debug!("Presentation thread exiting");
}

/// A presentable ring of images
pub struct Swapchain {
    sc_shared: Arc<SwapchainShared>,
    sc_thread: Mutex<Option<PresentThread>>,
}

impl Swapchain {
    /// Create a swapchain presenting through `backend`
    ///
    /// Unless allocation is deferred every image is allocated here, and
    /// a failure for any of them fails creation.
    pub fn new(
        dev: Arc<dyn Device>,
        mut backend: Box<dyn PlatformBackend>,
        info: &SwapchainCreateInfo,
    ) -> Result<Self> {
        if info.image_count == 0 {
            log::error!("Cannot create a swapchain with no images");
            return Err(WsiError::INVALID_STATE);
        }
        let present_modes = info.allowed_present_modes();
        if !present_modes.contains(&info.present_mode) {
            log::error!(
                "Present mode {:?} is not in the swapchain's mode list",
                info.present_mode
            );
            return Err(WsiError::INVALID_STATE);
        }

        let wants_thread = backend.init_platform(info).map_err(|e| {
            log::error!("Failed to initialize presentation backend: {}", e);
            e
        })?;
        let use_thread = info.presentation_thread.unwrap_or(wants_thread);

        let extensions = ExtensionTable::from_flags(&info.extensions, info.compression.as_ref())?;
        let mut alloc_flags = AllocFlags::empty();
        if info.extensions.protected_content {
            alloc_flags |= AllocFlags::PROTECTED;
        }
        if let Some(compression) = extensions.compression_control() {
            alloc_flags |= compression.alloc_flags();
        }

        let shared = Arc::new(SwapchainShared {
            ss_dev: dev,
            ss_backend: backend,
            ss_ring: Mutex::new(RingState {
                rs_images: (0..info.image_count).map(|_| SwapchainImage::new()).collect(),
                rs_error: None,
                rs_presented: false,
                rs_present_mode: info.present_mode,
                rs_destroyed: false,
                rs_in_flight: 0,
            }),
            ss_free_cond: Condvar::new(),
            ss_dispatch: Mutex::new(()),
            ss_extensions: extensions,
            ss_formats: FormatCache::new(),
            ss_params: info.image_params.clone(),
            ss_alloc_flags: alloc_flags,
            ss_present_modes: present_modes,
        });

        // From here on dropping the swapchain cleans up after us
        let swapchain = Self {
            sc_shared: shared,
            sc_thread: Mutex::new(None),
        };

        for index in 0..info.image_count as usize {
            if info.deferred_allocation {
                swapchain.sc_shared.lock_ring().rs_images[index].si_status = ImageStatus::Free;
                continue;
            }

            let (image, data) = swapchain.sc_shared.allocate_image().map_err(|e| {
                log::error!("Failed to allocate swapchain image {}: {}", index, e);
                e
            })?;
            let mut ring = swapchain.sc_shared.lock_ring();
            let slot = &mut ring.rs_images[index];
            slot.set_allocation(image, data);
            slot.si_status = ImageStatus::Free;
        }

        if use_thread {
            swapchain.start_present_thread()?;
        }

        log::debug!(
            "Created swapchain with {} images, presentation thread: {}",
            info.image_count,
            use_thread
        );
        Ok(swapchain)
    }

    fn start_present_thread(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let shared = self.sc_shared.clone();

        let handle = thread::Builder::new()
            .name("flipchain-present".to_string())
            .spawn(move || present_thread(shared, rx))
            .map_err(|e| {
                log::error!("Could not spawn presentation thread: {}", e);
                WsiError::INITIALIZATION_FAILED
            })?;

        *self.sc_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(PresentThread {
            pt_tx: tx,
            pt_handle: handle,
        });
        Ok(())
    }

    /// Let the presentation thread finish every queued present, then
    /// join it.
    fn stop_present_thread(&self) {
        let thread = self
            .sc_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(thread) = thread {
            if thread.pt_tx.send(PresentTask::Exit).is_err() {
                log::error!("Presentation thread exited early");
            }
            if thread.pt_handle.join().is_err() {
                log::error!("Presentation thread panicked");
            }
        }
    }

    /// Acquire a FREE image
    ///
    /// `timeout_ns` of 0 never blocks and `u64::MAX` waits forever.
    /// Returns TIMEOUT if no image became free in time.
    pub fn acquire_image(&self, timeout_ns: u64) -> Result<u32> {
        let shared = &self.sc_shared;
        let deadline = timing::deadline_from_nanos(timeout_ns);
        let mut ring = shared.lock_ring();

        let index = loop {
            if ring.rs_destroyed {
                return Err(WsiError::INVALID_STATE);
            }
            if let Some(err) = ring.rs_error {
                return Err(err);
            }
            if let Some(index) = ring.find_free() {
                ring.rs_images[index].si_status = ImageStatus::Acquired;
                break index;
            }

            if timeout_ns == 0 {
                return Err(WsiError::TIMEOUT);
            }
            let remaining_ns = match deadline {
                Some(d) => {
                    let left = timing::remaining(d);
                    if left.as_nanos() == 0 {
                        return Err(WsiError::TIMEOUT);
                    }
                    left.as_nanos().min(u64::MAX as u128 - 1) as u64
                }
                None => u64::MAX,
            };

            // The backend may block, don't hold the ring while it does
            drop(ring);
            let how = shared.ss_backend.wait_for_free_image(remaining_ns);
            ring = shared.lock_ring();

            match how {
                Err(e) => {
                    let err = match e.is_fatal() {
                        true => ring.latch_error(e),
                        false => e,
                    };
                    return Err(err);
                }
                Ok(FreeImageWait::Rescan) => continue,
                Ok(FreeImageWait::Condvar) => {}
            }

            // Something may have changed while we weren't holding the lock
            if ring.rs_error.is_some() || ring.rs_destroyed || ring.find_free().is_some() {
                continue;
            }
            ring = match deadline {
                Some(d) => {
                    shared
                        .ss_free_cond
                        .wait_timeout(ring, timing::remaining(d))
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => shared
                    .ss_free_cond
                    .wait(ring)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        };

        if ring.rs_images[index].is_allocated() {
            return Ok(index as u32);
        }

        // Deferred allocation happens outside the ring lock
        let _in_flight = InFlight::new(shared, &mut ring);
        drop(ring);
        let res = shared.allocate_image();

        let mut ring = shared.lock_ring();
        match res {
            Ok((image, data)) => {
                // Teardown is waiting on us, it will release the image
                ring.rs_images[index].set_allocation(image, data);
                if ring.rs_destroyed {
                    log::error!("Swapchain was destroyed while allocating image {}", index);
                    return Err(WsiError::INVALID_STATE);
                }
                Ok(index as u32)
            }
            Err(e) => {
                log::error!("Deferred allocation of image {} failed: {}", index, e);
                let slot = &mut ring.rs_images[index];
                slot.si_status = ImageStatus::Free;
                slot.si_data = None;
                shared.ss_free_cond.notify_all();
                Err(e)
            }
        }
    }

    /// Queue an ACQUIRED image for presentation
    ///
    /// With a presentation thread this returns once the present is
    /// queued, failures show up on later calls. Without one the present
    /// has finished when this returns.
    pub fn queue_present(&self, mut request: PendingPresentRequest) -> Result<()> {
        let shared = &self.sc_shared;
        let index = request.image_index as usize;

        let (image, data, _in_flight) = {
            let mut ring = shared.lock_ring();
            if ring.rs_destroyed {
                return Err(WsiError::INVALID_STATE);
            }
            if let Some(err) = ring.rs_error {
                return Err(err);
            }
            let slot = match ring.rs_images.get(index) {
                Some(s) => s,
                None => {
                    log::error!("Presenting image {} which does not exist", index);
                    return Err(WsiError::INVALID_STATE);
                }
            };
            if slot.si_status != ImageStatus::Acquired {
                log::error!(
                    "Presenting image {} which is {:?}, not acquired",
                    index,
                    slot.si_status
                );
                return Err(WsiError::INVALID_STATE);
            }
            let (image, data) = match slot.si_data.clone() {
                Some(d) => (slot.si_image, d),
                None => return Err(WsiError::INVALID_STATE),
            };

            if let Some(mode) = request.present_mode {
                if !shared.ss_present_modes.contains(&mode) {
                    log::error!("Present mode {:?} was not given at swapchain creation", mode);
                    return Err(WsiError::SURFACE_LOST);
                }
                ring.rs_present_mode = mode;
            }
            request.present_mode = Some(ring.rs_present_mode);

            ring.rs_images[index].si_status = ImageStatus::PendingPresent;
            let in_flight = InFlight::new(shared, &mut ring);
            (image, data, in_flight)
        };

        request.frame_boundary = frame_boundary::handle_frame_boundary_event(
            shared.ss_extensions.frame_boundary(),
            request.frame_boundary.take(),
            image,
        );

        let payload =
            shared
                .ss_backend
                .set_present_payload(&data, request.queue, &request.wait_semaphores);
        drop(data);
        if let Err(e) = payload {
            log::error!("Failed to set present payload for image {}: {}", index, e);
            shared.lock_ring().rs_images[index].si_status = ImageStatus::Acquired;
            return Err(e);
        }

        let thread = self.sc_thread.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = thread.as_ref() {
            return t.pt_tx.send(PresentTask::Present(request)).map_err(|_| {
                log::error!("Presentation thread is gone");
                let err = shared.lock_ring().latch_error(WsiError::SURFACE_LOST);
                shared.ss_free_cond.notify_all();
                err
            });
        }
        drop(thread);

        shared.dispatch(request)
    }

    /// Tear the swapchain down
    ///
    /// Queued presents finish first, and so do presents and allocations
    /// running on client threads. Calling this more than once is
    /// harmless, it also happens on drop.
    pub fn destroy(&self) {
        self.stop_present_thread();

        let shared = &self.sc_shared;
        let mut ring = shared.lock_ring();
        if ring.rs_destroyed {
            return;
        }
        // Nothing new starts from here on, and blocked acquires give up
        ring.rs_destroyed = true;
        shared.ss_free_cond.notify_all();

        while ring.rs_in_flight > 0 {
            ring = shared
                .ss_free_cond
                .wait(ring)
                .unwrap_or_else(|e| e.into_inner());
        }

        let mut released = Vec::new();
        for slot in ring.rs_images.iter_mut() {
            if slot.si_status == ImageStatus::Invalid {
                continue;
            }
            released.push((slot.si_image, slot.si_data.take()));
            slot.si_image = vk::Image::null();
            slot.si_status = ImageStatus::Invalid;
        }
        drop(ring);

        for (image, data) in released {
            if let Some(data) = data {
                match Arc::try_unwrap(data) {
                    Ok(data) => shared.ss_backend.destroy_image(image, data),
                    Err(_) => log::error!("Image data still in use during teardown"),
                }
            }
            if image != vk::Image::null() {
                shared.ss_dev.destroy_image(image);
            }
        }

        log::debug!("Destroyed swapchain");
    }

    pub fn image_count(&self) -> u32 {
        self.sc_shared.lock_ring().rs_images.len() as u32
    }

    /// The graphics image at `index`, null if it is not allocated
    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.sc_shared
            .lock_ring()
            .rs_images
            .get(index as usize)
            .map(|i| i.si_image)
    }

    pub fn image_status(&self, index: u32) -> Option<ImageStatus> {
        self.sc_shared
            .lock_ring()
            .rs_images
            .get(index as usize)
            .map(|i| i.si_status)
    }

    /// The latched error, if any
    pub fn error(&self) -> Option<WsiError> {
        self.sc_shared.lock_ring().rs_error
    }

    /// The mode presents currently use
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.sc_shared.lock_ring().rs_present_mode
    }

    /// The id of the last present on screen, if present ids are enabled
    pub fn last_present_id(&self) -> Option<u64> {
        self.sc_shared
            .ss_extensions
            .present_id()
            .map(|p| p.last_present_id())
    }

    /// The format and modifier chosen for external images
    pub fn negotiated_format(&self) -> Option<AllocFormat> {
        self.sc_shared.ss_formats.negotiated()
    }

    pub fn extensions(&self) -> &ExtensionTable {
        &self.sc_shared.ss_extensions
    }

    pub fn surface_capabilities(&self) -> SurfaceCapabilities {
        self.sc_shared.ss_backend.surface_properties().capabilities
    }

    pub fn surface_formats(&self) -> Vec<vk::SurfaceFormatKHR> {
        self.sc_shared.ss_backend.surface_properties().formats
    }

    pub fn present_modes(&self) -> Vec<vk::PresentModeKHR> {
        self.sc_shared.ss_backend.surface_properties().present_modes
    }

    /// Modes the surface can switch to from `mode`
    pub fn compatible_present_modes(&self, mode: vk::PresentModeKHR) -> Vec<vk::PresentModeKHR> {
        self.sc_shared
            .ss_backend
            .surface_properties()
            .compatibility
            .compatible_modes(mode)
            .to_vec()
    }

    /// Past present timings of an image
    ///
    /// Empty when the backend does not collect timings or the image has
    /// no memory yet.
    pub fn present_timing(&self, index: u32) -> Result<Vec<PresentTiming>> {
        let shared = &self.sc_shared;
        let (data, _in_flight) = {
            let mut ring = shared.lock_ring();
            let data = match ring.rs_images.get(index as usize) {
                Some(slot) => slot.si_data.clone(),
                None => return Err(WsiError::INVALID_STATE),
            };
            match data {
                Some(data) => (data, InFlight::new(shared, &mut ring)),
                None => return Ok(Vec::new()),
            }
        };

        let timings = shared.ss_backend.present_timing(&data);
        drop(data);
        Ok(timings)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}
