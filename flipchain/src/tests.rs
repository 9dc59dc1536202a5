/// Flipchain tests
///
/// These drive the swapchain core against a fake device, which hands
/// out made up handles and keeps track of what is alive, and a headless
/// backend we can break on demand.
///
/// Austin Shafer - 2024
use crate as fc;
use fc::allocator::{AllocError, AllocateInfo, AllocateResult, MAX_PLANES};
use fc::backend::{allocate_dmabuf_image, FreeImageWait, ImageCreateParams};
use fc::device::{ExplicitLayout, MemoryBinding};
use fc::external_memory::count_distinct_memories;
use fc::extensions::frame_boundary::LAYER_TAG_NAME;
use fc::extensions::FrameBoundaryFlags;
use fc::format::{CompatibleFormats, FormatCache};
use fc::surface::SurfaceProperties;
use fc::{
    BackendImage, Device, ExtensionFlags, FrameBoundary, ImageParams, ImageStatus,
    PendingPresentRequest, PlatformBackend, Swapchain, SwapchainCreateInfo, WsiError,
};

use ash::vk;
use ash::vk::Handle;

use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A driver that only does bookkeeping
#[derive(Default)]
struct FakeDevice {
    fd_next_handle: AtomicU64,
    fd_images: Mutex<Vec<vk::Image>>,
    fd_memories: Mutex<Vec<vk::DeviceMemory>>,
    fd_fences: Mutex<Vec<vk::Fence>>,
    /// Frees of handles we never handed out or already freed
    fd_bad_frees: AtomicU32,
    fd_submits: AtomicU32,
    fd_bindings: Mutex<Vec<MemoryBinding>>,
    fd_fail_bind: AtomicBool,
}

impl FakeDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fd_next_handle: AtomicU64::new(1),
            ..Default::default()
        })
    }

    fn next_handle(&self) -> u64 {
        self.fd_next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn live_images(&self) -> usize {
        self.fd_images.lock().unwrap().len()
    }

    fn live_memories(&self) -> usize {
        self.fd_memories.lock().unwrap().len()
    }

    fn live_fences(&self) -> usize {
        self.fd_fences.lock().unwrap().len()
    }

    fn remove<T: PartialEq>(&self, list: &Mutex<Vec<T>>, item: T) {
        let mut list = list.lock().unwrap();
        match list.iter().position(|i| *i == item) {
            Some(index) => {
                list.remove(index);
            }
            None => {
                self.fd_bad_frees.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl fc::Device for FakeDevice {
    fn create_image(
        &self,
        _params: &ImageParams,
        _layout: Option<&ExplicitLayout>,
    ) -> fc::Result<vk::Image> {
        let image = vk::Image::from_raw(self.next_handle());
        self.fd_images.lock().unwrap().push(image);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        self.remove(&self.fd_images, image);
    }

    fn allocate_image_memory(&self, _image: vk::Image) -> fc::Result<vk::DeviceMemory> {
        let memory = vk::DeviceMemory::from_raw(self.next_handle());
        self.fd_memories.lock().unwrap().push(memory);
        Ok(memory)
    }

    fn format_modifiers(
        &self,
        _format: vk::Format,
    ) -> fc::Result<Vec<vk::DrmFormatModifierPropertiesEXT>> {
        Ok(vec![vk::DrmFormatModifierPropertiesEXT {
            drm_format_modifier: fc::allocator::DRM_FORMAT_MOD_LINEAR,
            drm_format_modifier_plane_count: 1,
            drm_format_modifier_tiling_features: vk::FormatFeatureFlags::COLOR_ATTACHMENT,
        }])
    }

    fn external_memory_features(
        &self,
        _params: &ImageParams,
        _modifier: u64,
    ) -> fc::Result<vk::ExternalMemoryFeatureFlags> {
        Ok(vk::ExternalMemoryFeatureFlags::IMPORTABLE | vk::ExternalMemoryFeatureFlags::EXPORTABLE)
    }

    fn import_memory_fd(
        &self,
        image: vk::Image,
        _fd: RawFd,
        _plane: Option<u32>,
    ) -> fc::Result<vk::DeviceMemory> {
        self.allocate_image_memory(image)
    }

    fn bind_image_memory(&self, _image: vk::Image, bindings: &[MemoryBinding]) -> fc::Result<()> {
        if self.fd_fail_bind.load(Ordering::Relaxed) {
            return Err(WsiError::OUT_OF_MEMORY);
        }
        *self.fd_bindings.lock().unwrap() = bindings.to_vec();
        Ok(())
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.remove(&self.fd_memories, memory);
    }

    fn create_fence(&self) -> fc::Result<vk::Fence> {
        let fence = vk::Fence::from_raw(self.next_handle());
        self.fd_fences.lock().unwrap().push(fence);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.remove(&self.fd_fences, fence);
    }

    fn submit_fence_signal(
        &self,
        _queue: vk::Queue,
        _wait_semaphores: &[vk::Semaphore],
        _fence: vk::Fence,
    ) -> fc::Result<()> {
        self.fd_submits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Our "GPU" is always done
    fn wait_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> fc::Result<bool> {
        Ok(true)
    }
}

/// Knobs and counters shared between a test and its backend
#[derive(Default)]
struct BackendControl {
    bc_fail_present: AtomicBool,
    bc_fail_alloc: AtomicBool,
    /// Allocations past this many fail, 0 for no limit
    bc_alloc_limit: AtomicU32,
    bc_alloc_delay_ms: AtomicU64,
    bc_present_delay_ms: AtomicU64,
    bc_allocs: AtomicU32,
    bc_presents: AtomicU32,
    bc_first_presents: AtomicU32,
    bc_modes: Mutex<Vec<vk::PresentModeKHR>>,
    bc_boundaries: Mutex<Vec<Option<FrameBoundary>>>,
}

/// The headless backend with fault injection
struct TestBackend {
    tb_inner: fc::HeadlessBackend,
    tb_control: Arc<BackendControl>,
    tb_thread: bool,
}

impl PlatformBackend for TestBackend {
    fn init_platform(&mut self, info: &SwapchainCreateInfo) -> fc::Result<bool> {
        self.tb_inner.init_platform(info)?;
        Ok(self.tb_thread)
    }

    fn get_surface_compatible_formats(&self, params: &ImageParams) -> fc::Result<CompatibleFormats> {
        self.tb_inner.get_surface_compatible_formats(params)
    }

    fn is_format_supported(&self, fourcc: u32, modifier: u64) -> bool {
        self.tb_inner.is_format_supported(fourcc, modifier)
    }

    fn allocate_and_bind_image(
        &self,
        create: &ImageCreateParams,
    ) -> fc::Result<(vk::Image, BackendImage)> {
        let control = &self.tb_control;
        let count = control.bc_allocs.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = control.bc_alloc_limit.load(Ordering::Relaxed);
        if control.bc_fail_alloc.load(Ordering::Relaxed) || (limit > 0 && count > limit) {
            return Err(WsiError::OUT_OF_MEMORY);
        }
        sleep_ms(control.bc_alloc_delay_ms.load(Ordering::Relaxed));
        self.tb_inner.allocate_and_bind_image(create)
    }

    fn present_image(
        &self,
        request: &PendingPresentRequest,
        image: &BackendImage,
        first_present: bool,
    ) -> fc::Result<()> {
        let control = &self.tb_control;
        if control.bc_fail_present.load(Ordering::Relaxed) {
            return Err(WsiError::SURFACE_LOST);
        }

        control.bc_presents.fetch_add(1, Ordering::Relaxed);
        if first_present {
            control.bc_first_presents.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(mode) = request.present_mode {
            control.bc_modes.lock().unwrap().push(mode);
        }
        control
            .bc_boundaries
            .lock()
            .unwrap()
            .push(request.frame_boundary.clone());
        sleep_ms(control.bc_present_delay_ms.load(Ordering::Relaxed));

        self.tb_inner.present_image(request, image, first_present)
    }

    fn wait_for_free_image(&self, timeout_ns: u64) -> fc::Result<FreeImageWait> {
        self.tb_inner.wait_for_free_image(timeout_ns)
    }

    fn surface_properties(&self) -> SurfaceProperties {
        self.tb_inner.surface_properties()
    }

    fn present_timing(&self, image: &BackendImage) -> Vec<fc::PresentTiming> {
        self.tb_inner.present_timing(image)
    }
}

fn sleep_ms(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Spin until `done` holds, giving up after a few seconds
fn wait_until<F: Fn() -> bool>(done: F) {
    let start = Instant::now();
    while !done() && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(done());
}

/// Every image, memory and fence has been freed exactly once
fn assert_all_released(dev: &FakeDevice) {
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_memories(), 0);
    assert_eq!(dev.live_fences(), 0);
    assert_eq!(dev.fd_bad_frees.load(Ordering::Relaxed), 0);
}

struct TestSwapchain {
    ts_dev: Arc<FakeDevice>,
    ts_control: Arc<BackendControl>,
    ts_swapchain: Swapchain,
}

fn try_create(
    info: &SwapchainCreateInfo,
    thread: bool,
) -> (Arc<FakeDevice>, Arc<BackendControl>, fc::Result<Swapchain>) {
    let dev = FakeDevice::new();
    let control = Arc::new(BackendControl::default());
    let backend = TestBackend {
        tb_inner: fc::HeadlessBackend::new(dev.clone()),
        tb_control: control.clone(),
        tb_thread: thread,
    };

    let swapchain = Swapchain::new(dev.clone(), Box::new(backend), info);
    (dev, control, swapchain)
}

fn create(info: SwapchainCreateInfo, thread: bool) -> TestSwapchain {
    let (dev, control, swapchain) = try_create(&info, thread);
    TestSwapchain {
        ts_dev: dev,
        ts_control: control,
        ts_swapchain: swapchain.unwrap(),
    }
}

fn basic_info(count: u32) -> SwapchainCreateInfo {
    SwapchainCreateInfo::builder()
        .extent(64, 64)
        .image_count(count)
        .build()
}

/// Acquire and present `frames` times in a row
fn run_frames(swapchain: &Swapchain, frames: u32) {
    for frame in 0..frames {
        let index = swapchain.acquire_image(u64::MAX).unwrap();
        swapchain
            .queue_present(PendingPresentRequest::new(index).present_id(frame as u64 + 1))
            .unwrap();
    }
}

#[test]
fn creation_allocates_every_image() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    assert_eq!(swapchain.image_count(), 3);
    for i in 0..3 {
        assert_eq!(swapchain.image_status(i), Some(ImageStatus::Free));
        assert_ne!(swapchain.image(i), Some(vk::Image::null()));
    }
    assert_eq!(swapchain.image_status(3), None);
    assert_eq!(ts.ts_dev.live_images(), 3);
    assert_eq!(ts.ts_dev.live_fences(), 3);
    assert!(swapchain.error().is_none());
}

#[test]
fn creation_rejects_bad_info() {
    let (dev, _, res) = try_create(&basic_info(0), false);
    assert_eq!(res.err(), Some(WsiError::INVALID_STATE));
    assert_eq!(dev.live_images(), 0);

    let info = SwapchainCreateInfo::builder()
        .present_mode(vk::PresentModeKHR::MAILBOX)
        .present_modes(&[vk::PresentModeKHR::FIFO])
        .build();
    let (_, _, res) = try_create(&info, false);
    assert_eq!(res.err(), Some(WsiError::INVALID_STATE));
}

#[test]
fn creation_fails_cleanly_when_allocation_fails() {
    let dev = FakeDevice::new();
    let control = Arc::new(BackendControl::default());
    control.bc_fail_alloc.store(true, Ordering::Relaxed);
    let backend = TestBackend {
        tb_inner: fc::HeadlessBackend::new(dev.clone()),
        tb_control: control,
        tb_thread: false,
    };

    let res = Swapchain::new(dev.clone(), Box::new(backend), &basic_info(3));
    assert_eq!(res.err(), Some(WsiError::OUT_OF_MEMORY));
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_memories(), 0);
    assert_eq!(dev.live_fences(), 0);
}

#[test]
fn acquire_until_exhausted() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    let mut indices: Vec<u32> = (0..3).map(|_| swapchain.acquire_image(0).unwrap()).collect();
    indices.sort();
    assert_eq!(indices, vec![0, 1, 2]);
    for i in indices.iter() {
        assert_eq!(swapchain.image_status(*i), Some(ImageStatus::Acquired));
    }

    // Nothing left, and a zero timeout never blocks
    assert_eq!(swapchain.acquire_image(0), Err(WsiError::TIMEOUT));
}

#[test]
fn bounded_timeout_expires() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;
    swapchain.acquire_image(0).unwrap();
    swapchain.acquire_image(0).unwrap();

    let start = Instant::now();
    assert_eq!(
        swapchain.acquire_image(20_000_000),
        Err(WsiError::TIMEOUT)
    );
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(swapchain.error().is_none());
}

#[test]
fn present_retires_previous_image() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    let first = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(first)).unwrap();
    assert_eq!(swapchain.image_status(first), Some(ImageStatus::Presented));

    let second = swapchain.acquire_image(0).unwrap();
    assert_ne!(first, second);
    swapchain.queue_present(PendingPresentRequest::new(second)).unwrap();
    assert_eq!(swapchain.image_status(second), Some(ImageStatus::Presented));
    assert_eq!(swapchain.image_status(first), Some(ImageStatus::Free));

    // Only the very first present sets up the display
    assert_eq!(ts.ts_control.bc_presents.load(Ordering::Relaxed), 2);
    assert_eq!(ts.ts_control.bc_first_presents.load(Ordering::Relaxed), 1);
}

#[test]
fn present_wakes_blocked_acquire() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;

    let first = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(first)).unwrap();
    let second = swapchain.acquire_image(0).unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| swapchain.acquire_image(u64::MAX));

        std::thread::sleep(Duration::from_millis(20));
        swapchain.queue_present(PendingPresentRequest::new(second)).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(first));
    });
}

#[test]
fn concurrent_acquires_get_unique_images() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    let mut indices: Vec<u32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|_| s.spawn(|| swapchain.acquire_image(u64::MAX).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), 3);
}

#[test]
fn surface_lost_is_latched() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    let index = swapchain.acquire_image(0).unwrap();
    ts.ts_control.bc_fail_present.store(true, Ordering::Relaxed);
    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(index)),
        Err(WsiError::SURFACE_LOST)
    );
    assert_eq!(swapchain.error(), Some(WsiError::SURFACE_LOST));

    // Even once the connection recovers every call fails fast
    ts.ts_control.bc_fail_present.store(false, Ordering::Relaxed);
    assert_eq!(swapchain.acquire_image(u64::MAX), Err(WsiError::SURFACE_LOST));
    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(index)),
        Err(WsiError::SURFACE_LOST)
    );
}

#[test]
fn presenting_unacquired_image_is_rejected() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(1)),
        Err(WsiError::INVALID_STATE)
    );
    assert_eq!(swapchain.image_status(1), Some(ImageStatus::Free));

    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(7)),
        Err(WsiError::INVALID_STATE)
    );

    // Presenting the same image twice
    let index = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();
    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(index)),
        Err(WsiError::INVALID_STATE)
    );
    assert_eq!(swapchain.image_status(index), Some(ImageStatus::Presented));

    // None of this is fatal
    assert!(swapchain.error().is_none());
}

#[test]
fn wait_semaphores_arm_the_present_fence() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;
    let queue = vk::Queue::from_raw(0x1000);
    let semaphore = vk::Semaphore::from_raw(0x2000);

    let index = swapchain.acquire_image(0).unwrap();
    swapchain
        .queue_present(PendingPresentRequest::new(index).wait(queue, &[semaphore]))
        .unwrap();
    assert_eq!(ts.ts_dev.fd_submits.load(Ordering::Relaxed), 1);

    // Semaphores with nothing to wait on them from
    let index = swapchain.acquire_image(0).unwrap();
    assert_eq!(
        swapchain.queue_present(
            PendingPresentRequest::new(index).wait(vk::Queue::null(), &[semaphore])
        ),
        Err(WsiError::INVALID_STATE)
    );
    assert_eq!(swapchain.image_status(index), Some(ImageStatus::Acquired));
    assert!(swapchain.error().is_none());
}

#[test]
fn destroy_releases_every_image() {
    let ts = create(basic_info(3), false);
    let swapchain = &ts.ts_swapchain;

    // One presented, one acquired, one free
    let presented = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(presented)).unwrap();
    let acquired = swapchain.acquire_image(0).unwrap();
    assert_eq!(swapchain.image_status(acquired), Some(ImageStatus::Acquired));

    swapchain.destroy();
    for i in 0..3 {
        assert_eq!(swapchain.image_status(i), Some(ImageStatus::Invalid));
        assert_eq!(swapchain.image(i), Some(vk::Image::null()));
    }
    assert_eq!(ts.ts_dev.live_images(), 0);
    assert_eq!(ts.ts_dev.live_memories(), 0);
    assert_eq!(ts.ts_dev.live_fences(), 0);

    // A second destroy does nothing
    swapchain.destroy();
    assert_eq!(ts.ts_dev.fd_bad_frees.load(Ordering::Relaxed), 0);
    assert_eq!(swapchain.acquire_image(0), Err(WsiError::INVALID_STATE));
}

#[test]
fn destroy_drains_pending_presents() {
    let ts = create(basic_info(3), true);
    let swapchain = &ts.ts_swapchain;
    ts.ts_control.bc_present_delay_ms.store(100, Ordering::Relaxed);

    let first = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(first)).unwrap();
    let second = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(second)).unwrap();
    let acquired = swapchain.acquire_image(0).unwrap();

    // The thread is still busy with the first present
    assert_eq!(swapchain.image_status(second), Some(ImageStatus::PendingPresent));
    assert_eq!(swapchain.image_status(acquired), Some(ImageStatus::Acquired));

    swapchain.destroy();
    assert_eq!(ts.ts_control.bc_presents.load(Ordering::Relaxed), 2);
    for i in 0..3 {
        assert_eq!(swapchain.image_status(i), Some(ImageStatus::Invalid));
    }
    assert_all_released(&ts.ts_dev);
}

#[test]
fn destroy_releases_unallocated_images() {
    let info = SwapchainCreateInfo::builder()
        .image_count(3)
        .deferred_allocation(true)
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;

    // One allocated and presented, two never touched
    run_frames(swapchain, 1);
    assert_eq!(ts.ts_dev.live_images(), 1);
    assert_eq!(swapchain.image(1), Some(vk::Image::null()));

    swapchain.destroy();
    for i in 0..3 {
        assert_eq!(swapchain.image_status(i), Some(ImageStatus::Invalid));
    }
    assert_all_released(&ts.ts_dev);
}

#[test]
fn partially_created_swapchain_is_released() {
    let dev = FakeDevice::new();
    let control = Arc::new(BackendControl::default());
    control.bc_alloc_limit.store(2, Ordering::Relaxed);
    let backend = TestBackend {
        tb_inner: fc::HeadlessBackend::new(dev.clone()),
        tb_control: control.clone(),
        tb_thread: false,
    };

    // The third image never leaves INVALID
    let res = Swapchain::new(dev.clone(), Box::new(backend), &basic_info(3));
    assert_eq!(res.err(), Some(WsiError::OUT_OF_MEMORY));
    assert_eq!(control.bc_allocs.load(Ordering::SeqCst), 3);
    assert_all_released(&dev);
}

#[test]
fn destroy_waits_for_client_present() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;
    let control = &ts.ts_control;
    control.bc_present_delay_ms.store(200, Ordering::Relaxed);
    let index = swapchain.acquire_image(0).unwrap();

    std::thread::scope(|s| {
        let presenter = s.spawn(|| swapchain.queue_present(PendingPresentRequest::new(index)));

        wait_until(|| control.bc_presents.load(Ordering::Relaxed) == 1);
        swapchain.destroy();

        assert_eq!(presenter.join().unwrap(), Ok(()));
    });

    // The finished present did not bring the image back to life
    assert_eq!(swapchain.image_status(index), Some(ImageStatus::Invalid));
    assert_all_released(&ts.ts_dev);
    assert_eq!(
        swapchain.queue_present(PendingPresentRequest::new(index)),
        Err(WsiError::INVALID_STATE)
    );
}

#[test]
fn destroy_waits_for_deferred_allocation() {
    let info = SwapchainCreateInfo::builder()
        .image_count(2)
        .deferred_allocation(true)
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;
    let control = &ts.ts_control;
    control.bc_alloc_delay_ms.store(200, Ordering::Relaxed);

    std::thread::scope(|s| {
        let acquirer = s.spawn(|| swapchain.acquire_image(0));

        wait_until(|| control.bc_allocs.load(Ordering::SeqCst) == 1);
        swapchain.destroy();

        assert_eq!(acquirer.join().unwrap(), Err(WsiError::INVALID_STATE));
    });

    // The late allocation was released along with everything else
    assert_eq!(swapchain.image_status(0), Some(ImageStatus::Invalid));
    assert_all_released(&ts.ts_dev);
}

#[test]
fn drop_destroys_the_swapchain() {
    let ts = create(basic_info(3), true);
    let dev = ts.ts_dev.clone();
    run_frames(&ts.ts_swapchain, 4);

    drop(ts);
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_memories(), 0);
    assert_eq!(dev.live_fences(), 0);
    assert_eq!(dev.fd_bad_frees.load(Ordering::Relaxed), 0);
}

#[test]
fn deferred_allocation_happens_on_acquire() {
    let info = SwapchainCreateInfo::builder()
        .image_count(2)
        .deferred_allocation(true)
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;

    assert_eq!(ts.ts_dev.live_images(), 0);
    assert_eq!(swapchain.image_status(0), Some(ImageStatus::Free));
    assert_eq!(swapchain.image(0), Some(vk::Image::null()));

    // A failed allocation hands the image back
    ts.ts_control.bc_fail_alloc.store(true, Ordering::Relaxed);
    assert_eq!(swapchain.acquire_image(0), Err(WsiError::OUT_OF_MEMORY));
    assert_eq!(swapchain.image_status(0), Some(ImageStatus::Free));
    assert_eq!(swapchain.image_status(1), Some(ImageStatus::Free));
    assert!(swapchain.error().is_none());

    ts.ts_control.bc_fail_alloc.store(false, Ordering::Relaxed);
    let index = swapchain.acquire_image(0).unwrap();
    assert_ne!(swapchain.image(index), Some(vk::Image::null()));
    assert_eq!(ts.ts_dev.live_images(), 1);

    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();
    assert_eq!(swapchain.image_status(index), Some(ImageStatus::Presented));
}

#[test]
fn presentation_thread_drains_queued_presents() {
    let ts = create(basic_info(2), true);
    let swapchain = &ts.ts_swapchain;

    // Each acquire past the first two waits on the thread retiring one
    run_frames(swapchain, 10);
    swapchain.destroy();

    assert_eq!(ts.ts_control.bc_presents.load(Ordering::Relaxed), 10);
    assert_eq!(ts.ts_control.bc_first_presents.load(Ordering::Relaxed), 1);
    assert!(swapchain.error().is_none());
}

#[test]
fn presentation_thread_latches_errors() {
    let ts = create(basic_info(3), true);
    let swapchain = &ts.ts_swapchain;
    ts.ts_control.bc_fail_present.store(true, Ordering::Relaxed);

    let index = swapchain.acquire_image(0).unwrap();
    // Queuing succeeds, the failure shows up afterwards
    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();

    let start = Instant::now();
    while swapchain.error().is_none() && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(swapchain.error(), Some(WsiError::SURFACE_LOST));
    assert_eq!(swapchain.acquire_image(u64::MAX), Err(WsiError::SURFACE_LOST));
}

#[test]
fn present_id_is_recorded() {
    let info = SwapchainCreateInfo::builder()
        .image_count(2)
        .extensions(ExtensionFlags {
            present_id: true,
            ..Default::default()
        })
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;
    assert_eq!(swapchain.last_present_id(), Some(0));

    let index = swapchain.acquire_image(0).unwrap();
    swapchain
        .queue_present(PendingPresentRequest::new(index).present_id(7))
        .unwrap();
    assert_eq!(swapchain.last_present_id(), Some(7));

    // Presents without an id leave it alone
    let index = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();
    assert_eq!(swapchain.last_present_id(), Some(7));

    let plain = create(basic_info(2), false);
    run_frames(&plain.ts_swapchain, 1);
    assert_eq!(plain.ts_swapchain.last_present_id(), None);
}

#[test]
fn frame_boundaries_are_generated() {
    let info = SwapchainCreateInfo::builder()
        .image_count(2)
        .extensions(ExtensionFlags {
            frame_boundary_handling: true,
            ..Default::default()
        })
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;

    let index = swapchain.acquire_image(0).unwrap();
    let image = swapchain.image(index).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();

    // The application's own boundary is passed through untouched
    let app = FrameBoundary {
        flags: FrameBoundaryFlags::FRAME_END,
        frame_id: 99,
        images: Vec::new(),
        tag_name: 1,
        tag_size: 0,
    };
    let index = swapchain.acquire_image(0).unwrap();
    swapchain
        .queue_present(PendingPresentRequest::new(index).frame_boundary(app.clone()))
        .unwrap();

    let boundaries = ts.ts_control.bc_boundaries.lock().unwrap();
    let ours = boundaries[0].as_ref().unwrap();
    assert_eq!(ours.flags, FrameBoundaryFlags::FRAME_END);
    assert_eq!(ours.frame_id, 0);
    assert_eq!(ours.images, vec![image]);
    assert_eq!(ours.tag_name, LAYER_TAG_NAME);
    assert_eq!(boundaries[1], Some(app));
}

#[test]
fn present_mode_switching() {
    let info = SwapchainCreateInfo::builder()
        .image_count(2)
        .present_mode(vk::PresentModeKHR::FIFO)
        .present_modes(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED])
        .build();
    let ts = create(info, false);
    let swapchain = &ts.ts_swapchain;

    let index = swapchain.acquire_image(0).unwrap();
    swapchain
        .queue_present(PendingPresentRequest::new(index).present_mode(vk::PresentModeKHR::FIFO_RELAXED))
        .unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);

    // The switch sticks for later presents
    let index = swapchain.acquire_image(0).unwrap();
    swapchain.queue_present(PendingPresentRequest::new(index)).unwrap();
    assert_eq!(
        *ts.ts_control.bc_modes.lock().unwrap(),
        vec![vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO_RELAXED]
    );

    // A mode we were never told about
    let index = swapchain.acquire_image(0).unwrap();
    assert_eq!(
        swapchain.queue_present(
            PendingPresentRequest::new(index).present_mode(vk::PresentModeKHR::IMMEDIATE)
        ),
        Err(WsiError::SURFACE_LOST)
    );
    assert_eq!(swapchain.image_status(index), Some(ImageStatus::Acquired));
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
    assert!(swapchain.error().is_none());
}

#[test]
fn multi_present_reports_worst_error() {
    let good = create(basic_info(2), false);
    let bad = create(basic_info(2), false);
    bad.ts_control.bc_fail_present.store(true, Ordering::Relaxed);

    let good_index = good.ts_swapchain.acquire_image(0).unwrap();
    let bad_index = bad.ts_swapchain.acquire_image(0).unwrap();
    let res = fc::queue_present_multi(vec![
        (&bad.ts_swapchain, PendingPresentRequest::new(bad_index)),
        (&good.ts_swapchain, PendingPresentRequest::new(good_index)),
    ]);

    assert_eq!(res, Err(WsiError::SURFACE_LOST));
    // Every swapchain was still presented to
    assert_eq!(
        good.ts_swapchain.image_status(good_index),
        Some(ImageStatus::Presented)
    );

    let res = fc::queue_present_multi(vec![(
        &good.ts_swapchain,
        PendingPresentRequest::new(good_index),
    )]);
    assert_eq!(res, Err(WsiError::INVALID_STATE));
}

#[test]
fn surface_queries() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;

    let caps = swapchain.surface_capabilities();
    assert_eq!(caps.min_image_count, 1);
    assert_eq!(caps.max_image_count, fc::surface::MAX_SWAPCHAIN_IMAGE_COUNT);
    assert!(caps.supports_extent(vk::Extent2D {
        width: 64,
        height: 64
    }));

    let formats = swapchain.surface_formats();
    assert!(formats
        .iter()
        .any(|f| f.format == vk::Format::B8G8R8A8_SRGB));

    let modes = swapchain.present_modes();
    assert!(modes.contains(&vk::PresentModeKHR::FIFO));
    assert!(swapchain
        .compatible_present_modes(vk::PresentModeKHR::FIFO)
        .contains(&vk::PresentModeKHR::FIFO_RELAXED));
}

#[test]
fn present_timing_is_collected() {
    let ts = create(basic_info(2), false);
    let swapchain = &ts.ts_swapchain;

    let index = swapchain.acquire_image(0).unwrap();
    swapchain
        .queue_present(PendingPresentRequest::new(index).present_id(3))
        .unwrap();

    let timings = swapchain.present_timing(index).unwrap();
    assert_eq!(timings.len(), 1);
    assert_eq!(timings[0].present_id, 3);
    assert!(timings[0].actual_present_time > 0);

    // Collected timings are not reported again
    assert!(swapchain.present_timing(index).unwrap().is_empty());
    assert_eq!(swapchain.present_timing(9).err(), Some(WsiError::INVALID_STATE));
}

/// Hands out /dev/null fds shaped however the test asks
struct TestAllocator {
    ta_disjoint: bool,
}

impl fc::Allocator for TestAllocator {
    fn allocate(&self, info: &AllocateInfo) -> std::result::Result<AllocateResult, AllocError> {
        let format = *info.formats.first().ok_or(AllocError::Invalid)?;
        let fd = std::fs::File::open("/dev/null")
            .or(Err(AllocError::NoResource))?
            .into_raw_fd();

        let mut buffer_fds = [-1; MAX_PLANES];
        buffer_fds[0] = fd;
        let mut strides = [0; MAX_PLANES];
        strides[0] = info.width * 4;

        Ok(AllocateResult {
            format: format,
            strides: strides,
            offsets: [0; MAX_PLANES],
            buffer_fds: buffer_fds,
            is_disjoint: self.ta_disjoint,
        })
    }
}

fn allocate_external(
    dev: &Arc<FakeDevice>,
    allocator: &TestAllocator,
    cache: &FormatCache,
) -> fc::Result<(vk::Image, fc::external_memory::ExternalMemory)> {
    let params = ImageParams::default();
    let create = ImageCreateParams {
        params: &params,
        flags: fc::AllocFlags::empty(),
        formats: cache,
    };
    let dyn_dev: Arc<dyn fc::Device> = dev.clone();

    allocate_dmabuf_image(&dyn_dev, allocator, &create, || {
        fc::format::query_compatible_formats(&*dyn_dev, &params, &|_, modifier| {
            modifier == fc::allocator::DRM_FORMAT_MOD_LINEAR
        })
    })
}

#[test]
fn external_image_is_imported_and_bound() {
    let dev = FakeDevice::new();
    let cache = FormatCache::new();
    let (image, memory) = allocate_external(&dev, &TestAllocator { ta_disjoint: false }, &cache)
        .unwrap();

    assert_eq!(memory.num_planes(), 1);
    assert_eq!(memory.num_memories(), 1);
    assert!(!memory.is_disjoint());
    assert_eq!(
        memory.handle_type(),
        vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT
    );
    assert_eq!(dev.live_memories(), 1);
    {
        let bindings = dev.fd_bindings.lock().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].plane, None);
    }

    // The first allocation pins the format for the rest
    let negotiated = cache.negotiated().unwrap();
    assert_eq!(negotiated.fourcc, fc::format::DRM_FORMAT_ARGB8888);
    assert_eq!(negotiated.modifier, fc::allocator::DRM_FORMAT_MOD_LINEAR);

    drop(memory);
    dev.destroy_image(image);
    assert_eq!(dev.live_memories(), 0);
    assert_eq!(dev.live_images(), 0);
}

#[test]
fn disjoint_flag_must_match_buffers() {
    let dev = FakeDevice::new();
    let res = allocate_external(&dev, &TestAllocator { ta_disjoint: true }, &FormatCache::new());

    assert_eq!(res.err(), Some(WsiError::OUT_OF_MEMORY));
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_memories(), 0);
}

#[test]
fn failed_bind_cleans_up() {
    let dev = FakeDevice::new();
    dev.fd_fail_bind.store(true, Ordering::Relaxed);
    let res = allocate_external(&dev, &TestAllocator { ta_disjoint: false }, &FormatCache::new());

    assert_eq!(res.err(), Some(WsiError::OUT_OF_MEMORY));
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_memories(), 0);
    assert_eq!(dev.fd_bad_frees.load(Ordering::Relaxed), 0);
}

#[test]
fn distinct_memories_are_counted_once() {
    assert_eq!(count_distinct_memories(&[5, 5, 5, -1], 3), 1);
    assert_eq!(count_distinct_memories(&[5, 6, -1, -1], 2), 2);
    assert_eq!(count_distinct_memories(&[5, 6, 5, -1], 3), 2);
    assert_eq!(count_distinct_memories(&[5, 6, 7, 8], 1), 1);
}
