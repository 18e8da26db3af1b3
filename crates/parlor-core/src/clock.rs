//! Wall-clock and monotonic time helpers.
//!
//! Persisted values (message timestamps, display orders, event stamps) use
//! wall-clock epoch milliseconds. Liveness bookkeeping (`lastPing`,
//! `lastAlive`) uses a monotonic clock anchored at first use so that system
//! clock adjustments can never make a connection look idle.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds elapsed on the process-local monotonic clock.
///
/// Starts at `1` rather than `0` so a zeroed timestamp always reads as
/// "never".
pub fn monotonic_millis() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_millis() as u64 + 1
}
