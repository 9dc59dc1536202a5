// Swapchain extensions
//
// Optional features that ride along with a present request. The core
// looks them up by kind at creation, before submitting a present, and
// after a present lands on screen. None of them change how images move
// through the ring.
//
// Austin Shafer - 2024
pub mod compression;
pub mod frame_boundary;
pub mod present_id;

pub use compression::{CompressionControl, CompressionControlInfo};
pub use frame_boundary::{FrameBoundary, FrameBoundaryFlags, FrameBoundaryTagger};
pub use present_id::PresentIdTracker;

use crate::{ExtensionFlags, Result, WsiError};
use utils::log;

/// The kinds of extension a swapchain can carry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtensionKind {
    PresentId = 0,
    FrameBoundary = 1,
    CompressionControl = 2,
}

const NUM_EXTENSION_KINDS: usize = 3;

pub enum Extension {
    PresentId(PresentIdTracker),
    FrameBoundary(FrameBoundaryTagger),
    CompressionControl(CompressionControl),
}

impl Extension {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::PresentId(_) => ExtensionKind::PresentId,
            Extension::FrameBoundary(_) => ExtensionKind::FrameBoundary,
            Extension::CompressionControl(_) => ExtensionKind::CompressionControl,
        }
    }
}

/// The extensions enabled on one swapchain, at most one of each kind
pub struct ExtensionTable {
    et_slots: [Option<Extension>; NUM_EXTENSION_KINDS],
}

impl ExtensionTable {
    pub fn new() -> Self {
        Self {
            et_slots: [None, None, None],
        }
    }

    /// Build the table from the negotiated capability flags
    ///
    /// Compression control needs both the capability and the client's
    /// parameters.
    pub fn from_flags(
        flags: &ExtensionFlags,
        compression: Option<&CompressionControlInfo>,
    ) -> Result<Self> {
        let mut table = Self::new();

        if flags.present_id {
            table.add(Extension::PresentId(PresentIdTracker::new()))?;
        }
        if flags.frame_boundary_handling {
            table.add(Extension::FrameBoundary(FrameBoundaryTagger::new(true)))?;
        }
        if let Some(control) = CompressionControl::create(flags.compression_control, compression)? {
            table.add(Extension::CompressionControl(control))?;
        }

        Ok(table)
    }

    /// Enable an extension. Adding a kind twice is an error.
    pub fn add(&mut self, ext: Extension) -> Result<()> {
        let slot = &mut self.et_slots[ext.kind() as usize];
        if slot.is_some() {
            log::error!("Extension {:?} was already enabled", ext.kind());
            return Err(WsiError::INVALID_STATE);
        }
        *slot = Some(ext);
        Ok(())
    }

    pub fn get(&self, kind: ExtensionKind) -> Option<&Extension> {
        self.et_slots[kind as usize].as_ref()
    }

    pub fn is_enabled(&self, kind: ExtensionKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn present_id(&self) -> Option<&PresentIdTracker> {
        match self.get(ExtensionKind::PresentId) {
            Some(Extension::PresentId(p)) => Some(p),
            _ => None,
        }
    }

    pub fn frame_boundary(&self) -> Option<&FrameBoundaryTagger> {
        match self.get(ExtensionKind::FrameBoundary) {
            Some(Extension::FrameBoundary(f)) => Some(f),
            _ => None,
        }
    }

    pub fn compression_control(&self) -> Option<&CompressionControl> {
        match self.get(ExtensionKind::CompressionControl) {
            Some(Extension::CompressionControl(c)) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn empty_flags_enable_nothing() {
        let table = ExtensionTable::from_flags(&ExtensionFlags::default(), None).unwrap();
        assert!(!table.is_enabled(ExtensionKind::PresentId));
        assert!(!table.is_enabled(ExtensionKind::FrameBoundary));
        assert!(!table.is_enabled(ExtensionKind::CompressionControl));
    }

    #[test]
    fn lookup_by_kind() {
        let flags = ExtensionFlags {
            present_id: true,
            frame_boundary_handling: true,
            ..Default::default()
        };
        let table = ExtensionTable::from_flags(&flags, None).unwrap();

        assert!(table.present_id().is_some());
        assert!(table.frame_boundary().is_some());
        assert_eq!(
            table.get(ExtensionKind::PresentId).map(|e| e.kind()),
            Some(ExtensionKind::PresentId)
        );
    }

    #[test]
    fn compression_needs_flag_and_info() {
        let info = CompressionControlInfo::new(vk::ImageCompressionFlagsEXT::FIXED_RATE_DEFAULT);

        let flags = ExtensionFlags {
            compression_control: true,
            ..Default::default()
        };
        assert!(ExtensionTable::from_flags(&flags, None)
            .unwrap()
            .compression_control()
            .is_none());
        assert!(ExtensionTable::from_flags(&ExtensionFlags::default(), Some(&info))
            .unwrap()
            .compression_control()
            .is_none());
        assert!(ExtensionTable::from_flags(&flags, Some(&info))
            .unwrap()
            .compression_control()
            .is_some());
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut table = ExtensionTable::new();
        table
            .add(Extension::PresentId(PresentIdTracker::new()))
            .unwrap();
        assert_eq!(
            table.add(Extension::PresentId(PresentIdTracker::new())),
            Err(WsiError::INVALID_STATE)
        );
    }
}
