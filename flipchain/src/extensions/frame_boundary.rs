// Frame boundary tagging
//
// Tools use frame boundaries to find where one frame ends. If the
// application gave us one with its present we forward it, otherwise
// we can emit our own.
//
// Austin Shafer - 2024
use ash::vk;
use bitflags::bitflags;

use std::sync::atomic::{AtomicU64, Ordering};

/// Tag identifying boundaries we generated, "WSI" in ASCII
pub const LAYER_TAG_NAME: u64 = 0x575349;

bitflags! {
    pub struct FrameBoundaryFlags: u32 {
        const FRAME_END = 1 << 0;
    }
}

/// A frame boundary attached to a present's submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBoundary {
    pub flags: FrameBoundaryFlags,
    pub frame_id: u64,
    pub images: Vec<vk::Image>,
    pub tag_name: u64,
    /// Size of the tag payload. We never attach one.
    pub tag_size: usize,
}

/// Generates boundaries for a swapchain
pub struct FrameBoundaryTagger {
    /// Should we emit our own boundaries when the app doesn't
    fb_handle_events: bool,
    /// Our own frame counter. Presents handed to the presentation thread
    /// may not have been counted yet, so this is kept separately.
    fb_frame_id: AtomicU64,
}

impl FrameBoundaryTagger {
    pub fn new(handle_events: bool) -> Self {
        Self {
            fb_handle_events: handle_events,
            fb_frame_id: AtomicU64::new(0),
        }
    }

    fn create_frame_boundary(&self, image: vk::Image) -> FrameBoundary {
        FrameBoundary {
            flags: FrameBoundaryFlags::FRAME_END,
            frame_id: self.fb_frame_id.fetch_add(1, Ordering::Relaxed),
            images: vec![image],
            tag_name: LAYER_TAG_NAME,
            tag_size: 0,
        }
    }

    pub fn handle_frame_boundary_event(
        &self,
        app_boundary: Option<FrameBoundary>,
        image: vk::Image,
    ) -> Option<FrameBoundary> {
        if app_boundary.is_some() {
            return app_boundary;
        }
        if self.fb_handle_events {
            return Some(self.create_frame_boundary(image));
        }
        None
    }
}

/// Pick the boundary to submit with a present
///
/// The application's boundary always wins. Without a tagger nothing
/// else is generated.
pub fn handle_frame_boundary_event(
    tagger: Option<&FrameBoundaryTagger>,
    app_boundary: Option<FrameBoundary>,
    image: vk::Image,
) -> Option<FrameBoundary> {
    match tagger {
        Some(t) => t.handle_frame_boundary_event(app_boundary, image),
        None => app_boundary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn app_boundary() -> FrameBoundary {
        FrameBoundary {
            flags: FrameBoundaryFlags::empty(),
            frame_id: 77,
            images: Vec::new(),
            tag_name: 1,
            tag_size: 0,
        }
    }

    #[test]
    fn layer_boundaries_count_up() {
        let tagger = FrameBoundaryTagger::new(true);
        let image = vk::Image::from_raw(5);

        let first = handle_frame_boundary_event(Some(&tagger), None, image).unwrap();
        let second = handle_frame_boundary_event(Some(&tagger), None, image).unwrap();

        assert_eq!(first.flags, FrameBoundaryFlags::FRAME_END);
        assert_eq!(first.frame_id, 0);
        assert_eq!(second.frame_id, 1);
        assert_eq!(first.images, vec![image]);
        assert_eq!(first.tag_name, 0x575349);
        assert_eq!(first.tag_size, 0);
    }

    #[test]
    fn application_boundary_wins() {
        let tagger = FrameBoundaryTagger::new(true);
        let image = vk::Image::from_raw(5);

        let res = handle_frame_boundary_event(Some(&tagger), Some(app_boundary()), image);
        assert_eq!(res, Some(app_boundary()));

        let res = handle_frame_boundary_event(None, Some(app_boundary()), image);
        assert_eq!(res, Some(app_boundary()));
    }

    #[test]
    fn nothing_without_handling() {
        let image = vk::Image::from_raw(5);
        assert_eq!(handle_frame_boundary_event(None, None, image), None);

        let tagger = FrameBoundaryTagger::new(false);
        assert_eq!(handle_frame_boundary_event(Some(&tagger), None, image), None);
    }
}
