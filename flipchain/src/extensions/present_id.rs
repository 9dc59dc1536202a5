// Present id tracking
//
// Austin Shafer - 2024
use std::sync::atomic::{AtomicU64, Ordering};

/// Records the id of the last present that reached the screen
pub struct PresentIdTracker {
    pi_last: AtomicU64,
}

impl PresentIdTracker {
    pub fn new() -> Self {
        Self {
            pi_last: AtomicU64::new(0),
        }
    }

    /// Called once the present carrying `id` is on screen
    pub fn set_present_id(&self, id: u64) {
        self.pi_last.store(id, Ordering::Release);
    }

    /// The last id presented, 0 if nothing with an id has been shown
    pub fn last_present_id(&self) -> u64 {
        self.pi_last.load(Ordering::Acquire)
    }
}
