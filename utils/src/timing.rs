// Timing helpers
//
// Austin Shafer - 2020
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get the current wall clock time in milliseconds
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Convert a nanosecond timeout into a deadline.
///
/// `u64::MAX` means wait forever and yields `None`.
pub fn deadline_from_nanos(timeout_ns: u64) -> Option<Instant> {
    match timeout_ns {
        u64::MAX => None,
        ns => Some(Instant::now() + Duration::from_nanos(ns)),
    }
}

/// Time left until a deadline, saturating at zero
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
