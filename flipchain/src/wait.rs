// Bounded waits on display completion events
//
// Both the DRM flip event and the wayland buffer release arrive on a
// file descriptor. We poll it in one second slices, retry on
// interruption, and give up waiting (but keep going) if the display
// never answers.
//
// Austin Shafer - 2024
use crate::{Result, WsiError};
use utils::fdwatch::FdWatch;
use utils::log;

use nix::errno::Errno;
use std::os::unix::io::RawFd;

/// How long a single poll slice lasts
pub const POLL_TIMEOUT_MS: usize = 1000;

/// What to do with the outcome of one poll
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitClass {
    /// The fd has events to read
    Ready,
    /// Nothing arrived in time. The swap is assumed to have happened.
    SoftTimeout,
    /// Interrupted, poll again
    Retry,
    /// The connection is unusable
    Fatal(Errno),
}

pub fn classify(res: nix::Result<bool>) -> WaitClass {
    match res {
        Ok(true) => WaitClass::Ready,
        Ok(false) => WaitClass::SoftTimeout,
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => WaitClass::Retry,
        Err(e) => WaitClass::Fatal(e),
    }
}

/// Watches a single display fd
pub struct CompletionWait {
    cw_watch: FdWatch,
}

impl CompletionWait {
    pub fn new(fd: RawFd) -> Result<Self> {
        let mut watch = FdWatch::new().map_err(|e| {
            log::error!("Could not create fd watcher: {}", e);
            WsiError::OUT_OF_MEMORY
        })?;
        watch.add_fd(fd);
        watch.register_events().map_err(|e| {
            log::error!("Could not watch display fd {}: {}", fd, e);
            WsiError::SURFACE_LOST
        })?;

        Ok(Self { cw_watch: watch })
    }

    /// Poll for one slice and classify the result
    pub fn poll(&mut self) -> WaitClass {
        classify(self.cw_watch.wait_for_events(Some(POLL_TIMEOUT_MS)))
    }

    /// Wait until `on_ready` reports completion
    ///
    /// `on_ready` is called every time the fd becomes readable and should
    /// consume the pending events, returning true once the event we are
    /// waiting for has arrived.
    pub fn wait<F>(&mut self, what: &str, mut on_ready: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        loop {
            match self.poll() {
                WaitClass::Ready => {
                    if on_ready()? {
                        return Ok(());
                    }
                }
                WaitClass::Retry => continue,
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

/// Wait on `fd` until `on_ready` returns true
pub fn wait_for_completion<F>(fd: RawFd, what: &str, on_ready: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    CompletionWait::new(fd)?.wait(what, on_ready)
}
