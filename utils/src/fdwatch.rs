// Helper class for watching file descriptors
// OS-compatibility layer
//
// The watcher never owns the descriptors it is handed. Callers
// (the DRM connection, the wayland display) keep them alive for
// as long as the watcher is used.
//
// Austin Shafer - 2020
extern crate nix;

#[cfg(target_os = "freebsd")]
use nix::sys::event::*;
#[cfg(not(target_os = "freebsd"))]
use nix::sys::select::*;

#[cfg(not(target_os = "freebsd"))]
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

// =============================================
// kqueue version
// =============================================

// A file descriptor watcher
#[cfg(target_os = "freebsd")]
pub struct FdWatch {
    // The kqueue fd
    fdw_kq: Kqueue,
    // Events to watch
    fdw_events: Vec<KEvent>,
}

#[cfg(target_os = "freebsd")]
impl FdWatch {
    // Helper for creating a kevent for reading an fd
    fn read_fd_kevent(fd: RawFd) -> KEvent {
        KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD,
            FilterFlag::all(),
            0,
            0,
        )
    }

    pub fn new() -> nix::Result<FdWatch> {
        Ok(FdWatch {
            fdw_kq: Kqueue::new()?,
            fdw_events: Vec::new(),
        })
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        let kev = FdWatch::read_fd_kevent(fd);
        self.fdw_events.push(kev);
    }

    pub fn register_events(&mut self) -> nix::Result<()> {
        // Register our kevent with the kqueue to receive updates
        self.fdw_kq
            .kevent(self.fdw_events.as_slice(), &mut [], None)
            .map(|_| ())
    }

    /// Wait for one of our fds to become readable.
    ///
    /// timeout in ms, `None` blocks. Returns Ok(true) if something
    /// is ready to be read and Ok(false) if the timeout expired.
    pub fn wait_for_events(&mut self, timeout: Option<usize>) -> nix::Result<bool> {
        self.fdw_kq
            .kevent(
                &[],
                self.fdw_events.as_mut_slice(),
                timeout.map(|t| {
                    *nix::sys::time::TimeSpec::from_duration(std::time::Duration::from_millis(
                        t as u64,
                    ))
                    .as_ref()
                }),
            )
            .map(|count| count > 0)
    }
}

// =============================================
// Generic select
// =============================================

// A file descriptor watcher
#[cfg(not(target_os = "freebsd"))]
pub struct FdWatch {
    // fds to watch for readability
    fdw_fds: Vec<RawFd>,
}

#[cfg(not(target_os = "freebsd"))]
impl FdWatch {
    pub fn new() -> nix::Result<FdWatch> {
        Ok(FdWatch {
            fdw_fds: Vec::new(),
        })
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_fds.push(fd);
    }

    pub fn register_events(&mut self) -> nix::Result<()> {
        // noop since select doesn't need registration
        Ok(())
    }

    /// Wait for one of our fds to become readable.
    ///
    /// timeout in ms, `None` blocks. Returns Ok(true) if something
    /// is ready to be read and Ok(false) if the timeout expired.
    /// Interruptions are handed back as `Errno::EINTR` so the caller
    /// can decide whether to retry.
    pub fn wait_for_events(&mut self, timeout: Option<usize>) -> nix::Result<bool> {
        use nix::sys::time::TimeValLike;

        let mut fdset = FdSet::new();
        for fd in self.fdw_fds.iter() {
            // The owners of these fds outlive this call
            fdset.insert(unsafe { BorrowedFd::borrow_raw(*fd) });
        }

        let mut out = timeout.map(|ms| nix::sys::time::TimeVal::milliseconds(ms as i64));
        select(None, Some(&mut fdset), None, None, out.as_mut()).map(|count| count > 0)
    }
}
