/// DRM Device
///
/// Austin - 2024
#[cfg(target_os = "linux")]
use nix::sys::stat::makedev;

use super::drm::Device;
use utils::{log, Context};

use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;

// In FreeBSD types.h:
//
// #define makedev(M, m)   __makedev((M), (m))
// static __inline dev_t
// __makedev(int _Major, int _Minor)
// {
//     return (((dev_t)(_Major & 0xffffff00) << 32) | ((_Major & 0xff) << 8) |
//         ((dev_t)(_Minor & 0xff00) << 24) | (_Minor & 0xffff00ff));
// }
#[cfg(target_os = "freebsd")]
fn makedev(major: u64, minor: u64) -> u64 {
    (((major & 0xffffff00) as u64) << 32)
        | (((major & 0xff) as u64) << 8)
        | ((minor & 0xff00 as u64) << 24)
        | (minor & 0xffff00ff)
}

/// Our DRM node accessor helper
///
/// This provides drm-rs with access to the DRM fd
/// and gives us a place to make calls to DRM
pub struct DrmDevice {
    ds_drm_fd: File,
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.ds_drm_fd.as_fd()
    }
}

impl Device for DrmDevice {}
impl drm::control::Device for DrmDevice {}

impl DrmDevice {
    /// Open the primary node for a device number
    pub fn from_dev_t(major: i64, minor: i64) -> utils::Result<Self> {
        let dev_t = makedev(major as u64, minor as u64);
        #[cfg(target_os = "freebsd")]
        let dev_t = dev_t as u32;
        let path = drm::node::dev_path(dev_t.into(), drm::node::NodeType::Primary)
            .with_context(|| format!("Could not get DRM path from dev_t {}", dev_t))?;

        Self::open(&path)
    }

    /// Open a DRM node and request the client caps we need
    pub fn open(path: &Path) -> utils::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Could not open DRM Device path {}", path.display()))?;

        let ret = DrmDevice { ds_drm_fd: file };
        ret.set_client_capability(drm::ClientCapability::UniversalPlanes, true)
            .context("Failed to request UniversalPlanes capability")?;
        ret.set_client_capability(drm::ClientCapability::Atomic, true)
            .context("Failed to request Atomic capability")?;

        log::debug!("Opened DRM device {}", path.display());
        Ok(ret)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.ds_drm_fd.as_raw_fd()
    }

    /// A second handle on the node, for GBM
    pub fn dup_fd(&self) -> utils::Result<OwnedFd> {
        let file = self
            .ds_drm_fd
            .try_clone()
            .context("Could not duplicate DRM fd")?;
        Ok(OwnedFd::from(file))
    }
}
