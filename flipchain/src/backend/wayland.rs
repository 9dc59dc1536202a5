/// Wayland backend
///
/// Images are shared with the compositor as linux-dmabuf `wl_buffer`s
/// attached to the client's `wl_surface`. We run our own event queue
/// on the client's display so none of our events are dispatched by the
/// application.
///
/// Austin Shafer - 2024
extern crate wayland_client;
extern crate wayland_protocols;

use wayland_client as wc;
use wc::protocol::{wl_buffer, wl_callback, wl_surface};
use wayland_protocols::unstable::linux_dmabuf::v1::client::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};

use ash::vk;

use super::{allocate_dmabuf_image, BackendImage, ImageCreateParams, PlatformBackend};
use crate::allocator::dma_heap::DmaHeapAllocator;
use crate::device::{Device, ImageParams};
use crate::external_memory::ExternalMemory;
use crate::format::{self, CompatibleFormats};
use crate::surface::{surface_formats_for_fourccs, SurfaceCapabilities, SurfaceProperties};
use crate::swapchain::PendingPresentRequest;
use crate::sync::FenceSync;
use crate::wait::{CompletionWait, WaitClass};
use crate::{Result, SwapchainCreateInfo, WsiError};
use utils::log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Largest buffer we will ask the compositor to import
const MAX_DIMENSION: u32 = 16384;

const PRESENT_MODES: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

/// Our private event queue on the client's display
struct WaylandQueue {
    wq_display: wc::Display,
    wq_queue: wc::EventQueue,
}

impl WaylandQueue {
    fn dispatch_pending(&mut self) -> Result<()> {
        self.wq_queue
            .dispatch_pending(&mut (), |_, _, _| {})
            .map(|_| ())
            .map_err(|e| {
                log::error!("Failed to dispatch wayland events: {}", e);
                WsiError::SURFACE_LOST
            })
    }

    fn roundtrip(&mut self) -> Result<()> {
        self.wq_queue
            .sync_roundtrip(&mut (), |_, _, _| {})
            .map(|_| ())
            .map_err(|e| {
                log::error!("Wayland roundtrip failed: {}", e);
                WsiError::SURFACE_LOST
            })
    }

    fn flush(&self) -> Result<()> {
        match self.wq_display.flush() {
            Ok(()) => Ok(()),
            // The rest goes out with the next flush
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                log::error!("Failed to flush the wayland display: {}", e);
                Err(WsiError::SURFACE_LOST)
            }
        }
    }

    /// Read and dispatch events until `done` holds
    ///
    /// Like every display wait this gives up after one quiet poll slice.
    fn wait_until<F: Fn() -> bool>(&mut self, what: &str, done: F) -> Result<()> {
        let mut watch = CompletionWait::new(self.wq_display.get_connection_fd())?;

        loop {
            self.dispatch_pending()?;
            if done() {
                return Ok(());
            }

            // Some events are already queued, dispatch those first
            let guard = match self.wq_queue.prepare_read() {
                Some(guard) => guard,
                None => continue,
            };
            self.flush()?;

            match watch.poll() {
                WaitClass::Ready => match guard.read_events() {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        log::error!("Failed to read wayland events: {}", e);
                        return Err(WsiError::SURFACE_LOST);
                    }
                },
                // Dropping the guard cancels the read
                WaitClass::Retry => drop(guard),
                WaitClass::SoftTimeout => {
                    log::error!("Timed out waiting for {}, continuing", what);
                    return Ok(());
                }
                WaitClass::Fatal(e) => {
                    log::error!("Failed waiting for {}: {}", what, e);
                    return Err(WsiError::SURFACE_LOST);
                }
            }
        }
    }
}

/// A dmabuf shared with the compositor
pub struct WaylandImage {
    wi_buffer: wc::Main<wl_buffer::WlBuffer>,
    /// Set while the compositor holds the buffer
    wi_busy: Arc<AtomicBool>,
    wi_memory: ExternalMemory,
    pub(crate) wi_present_fence: Mutex<FenceSync>,
}

impl WaylandImage {
    pub fn memory(&self) -> &ExternalMemory {
        &self.wi_memory
    }
}

impl Drop for WaylandImage {
    fn drop(&mut self) {
        self.wi_buffer.destroy();
    }
}

/// A backend presenting to a wayland surface
pub struct WaylandBackend {
    wb_dev: Arc<dyn Device>,
    wb_queue: Mutex<WaylandQueue>,
    wb_surface: wc::Attached<wl_surface::WlSurface>,
    wb_dmabuf: wc::Main<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    /// (fourcc, modifier) pairs advertised by the compositor
    wb_formats: Arc<Mutex<Vec<(u32, u64)>>>,
    /// The last frame callback has fired
    wb_frame_done: Arc<AtomicBool>,
    /// Busy flag of the buffer currently attached to the surface
    wb_attached: Mutex<Option<Arc<AtomicBool>>>,
    /// Created in init_platform
    wb_allocator: Option<DmaHeapAllocator>,
}

// Every wayland object is only used with wb_queue held, and all events
// are dispatched from the thread presenting.
unsafe impl Send for WaylandBackend {}
unsafe impl Sync for WaylandBackend {}
unsafe impl Send for WaylandImage {}
unsafe impl Sync for WaylandImage {}

impl WaylandBackend {
    /// Connect to the client's display and surface
    ///
    /// # Safety
    ///
    /// `display` and `surface` must be live libwayland objects which
    /// outlive the returned backend.
    pub unsafe fn new(
        dev: Arc<dyn Device>,
        display: *mut wc::sys::client::wl_display,
        surface: *mut wc::sys::client::wl_proxy,
    ) -> Result<Self> {
        let display = wc::Display::from_external_display(display);
        let queue = display.create_event_queue();
        let attached = (*display).clone().attach(queue.token());
        let surface = wc::Proxy::<wl_surface::WlSurface>::from_c_ptr(surface).attach(queue.token());

        let mut queue = WaylandQueue {
            wq_display: display,
            wq_queue: queue,
        };

        let gman = wc::GlobalManager::new(&attached);
        queue.roundtrip()?;

        let dmabuf = gman
            .instantiate_exact::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>(3)
            .map_err(|e| {
                log::error!("Compositor does not support linux-dmabuf v3: {}", e);
                WsiError::INITIALIZATION_FAILED
            })?;

        let formats = Arc::new(Mutex::new(Vec::new()));
        let formats_clone = formats.clone();
        dmabuf.quick_assign(move |_, event, _| {
            if let zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } = event
            {
                let modifier = ((modifier_hi as u64) << 32) | modifier_lo as u64;
                let mut formats = formats_clone.lock().unwrap_or_else(|e| e.into_inner());
                if !formats.contains(&(format, modifier)) {
                    formats.push((format, modifier));
                }
            }
        });
        // Get the format list
        queue.roundtrip()?;

        log::debug!(
            "Compositor supports {} dmabuf format/modifier pairs",
            formats.lock().unwrap_or_else(|e| e.into_inner()).len()
        );

        Ok(Self {
            wb_dev: dev,
            wb_queue: Mutex::new(queue),
            wb_surface: surface,
            wb_dmabuf: dmabuf,
            wb_formats: formats,
            wb_frame_done: Arc::new(AtomicBool::new(true)),
            wb_attached: Mutex::new(None),
            wb_allocator: None,
        })
    }

    fn lock_queue(&self) -> MutexGuard<WaylandQueue> {
        self.wb_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wrap the image's planes in a wl_buffer
    fn create_buffer(
        &self,
        params: &ImageParams,
        memory: &ExternalMemory,
        fourcc: u32,
    ) -> (wc::Main<wl_buffer::WlBuffer>, Arc<AtomicBool>) {
        let _queue = self.lock_queue();
        let modifier = memory.modifier();

        let buffer_params = self.wb_dmabuf.create_params();
        for plane in 0..memory.num_planes() as usize {
            buffer_params.add(
                memory.buffer_fds()[plane],
                plane as u32,
                memory.offsets()[plane],
                memory.strides()[plane],
                (modifier >> 32) as u32,
                (modifier & 0xffff_ffff) as u32,
            );
        }

        let buffer = buffer_params.create_immed(
            params.extent.width as i32,
            params.extent.height as i32,
            fourcc,
            zwp_linux_buffer_params_v1::Flags::empty(),
        );
        buffer_params.destroy();

        let busy = Arc::new(AtomicBool::new(false));
        let busy_clone = busy.clone();
        buffer.quick_assign(move |_, event, _| {
            if let wl_buffer::Event::Release = event {
                busy_clone.store(false, Ordering::Release);
            }
        });

        (buffer, busy)
    }
}

impl PlatformBackend for WaylandBackend {
    fn init_platform(&mut self, info: &SwapchainCreateInfo) -> Result<bool> {
        let allocator = DmaHeapAllocator::new().map_err(|e| {
            log::error!("Could not open a DMA-BUF heap: {}", e);
            WsiError::INITIALIZATION_FAILED
        })?;
        self.wb_allocator = Some(allocator);

        log::debug!(
            "Wayland swapchain with {} images of {:?}",
            info.image_count,
            info.image_params.extent
        );
        // Presents are committed from the client's thread
        Ok(false)
    }

    fn get_surface_compatible_formats(&self, params: &ImageParams) -> Result<CompatibleFormats> {
        format::query_compatible_formats(&*self.wb_dev, params, &|fourcc, modifier| {
            self.is_format_supported(fourcc, modifier)
        })
    }

    fn is_format_supported(&self, fourcc: u32, modifier: u64) -> bool {
        self.wb_formats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(fourcc, modifier))
    }

    fn allocate_and_bind_image(&self, create: &ImageCreateParams) -> Result<(vk::Image, BackendImage)> {
        let allocator = self.wb_allocator.as_ref().ok_or(WsiError::INVALID_STATE)?;
        let fence = FenceSync::new(self.wb_dev.clone())?;
        let (image, memory) = allocate_dmabuf_image(&self.wb_dev, allocator, create, || {
            self.get_surface_compatible_formats(create.params)
        })?;

        let fourcc = create
            .formats
            .negotiated()
            .map(|f| f.fourcc)
            .unwrap_or_else(|| format::vk_to_drm_format(create.params.format));
        let (buffer, busy) = self.create_buffer(create.params, &memory, fourcc);

        Ok((
            image,
            BackendImage::Wayland(WaylandImage {
                wi_buffer: buffer,
                wi_busy: busy,
                wi_memory: memory,
                wi_present_fence: Mutex::new(fence),
            }),
        ))
    }

    fn present_image(
        &self,
        request: &PendingPresentRequest,
        image: &BackendImage,
        _first_present: bool,
    ) -> Result<()> {
        let data = match image {
            BackendImage::Wayland(data) => data,
            _ => return Err(WsiError::INVALID_STATE),
        };
        let fifo = request.present_mode.unwrap_or(vk::PresentModeKHR::FIFO)
            == vk::PresentModeKHR::FIFO;

        let mut queue = self.lock_queue();
        if fifo {
            let done = self.wb_frame_done.clone();
            queue.wait_until("frame callback", || done.load(Ordering::Acquire))?;
        }

        data.wi_busy.store(true, Ordering::Release);
        self.wb_surface.attach(Some(&data.wi_buffer), 0, 0);
        self.wb_surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        if fifo {
            self.wb_frame_done.store(false, Ordering::Release);
            let done = self.wb_frame_done.clone();
            self.wb_surface.frame().quick_assign(move |_, event, _| {
                if let wl_callback::Event::Done { .. } = event {
                    done.store(true, Ordering::Release);
                }
            });
        }
        self.wb_surface.commit();
        queue.flush()?;

        // The previous buffer is released once ours replaces it. Wait for
        // that so only one image is ever on screen.
        let previous = self
            .wb_attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(data.wi_busy.clone());
        match previous {
            Some(prev) if !Arc::ptr_eq(&prev, &data.wi_busy) => {
                queue.wait_until("buffer release", || !prev.load(Ordering::Acquire))
            }
            _ => Ok(()),
        }
    }

    fn destroy_image(&self, _image: vk::Image, data: BackendImage) {
        if let BackendImage::Wayland(image) = &data {
            let mut attached = self.wb_attached.lock().unwrap_or_else(|e| e.into_inner());
            if attached
                .as_ref()
                .map(|a| Arc::ptr_eq(a, &image.wi_busy))
                .unwrap_or(false)
            {
                *attached = None;
            }
        }

        let _queue = self.lock_queue();
        drop(data);
    }

    fn surface_properties(&self) -> SurfaceProperties {
        let mut fourccs: Vec<u32> = Vec::new();
        for (fourcc, _) in self
            .wb_formats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            if !fourccs.contains(fourcc) {
                fourccs.push(*fourcc);
            }
        }

        SurfaceProperties::new(
            SurfaceCapabilities::common(MAX_DIMENSION),
            surface_formats_for_fourccs(&fourccs),
            &PRESENT_MODES,
        )
    }
}
