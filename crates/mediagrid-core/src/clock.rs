//! Process-relative monotonic clock.
//!
//! Backend bookkeeping (last-release ordering, pressure age, stuck-load
//! tracking) compares millisecond tick values rather than wall-clock
//! times, so clock adjustments never reorder backends.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call in this process. Monotonic.
pub fn ticks_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
