//! Microsecond timestamps, used for reception ids' correlated logging and
//! for the delay/timeout arithmetic in both halves of the framework.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, saturating rather than panicking if
/// the system clock is set before 1970.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
