//! Retry utilities: backoff builders for broker connection attempts.
//!
//! Connection retries are uniform-interval and bounded: no exponential
//! growth, no jitter.

use std::time::Duration;

use backon::ConstantBuilder;

/// Default number of connection attempts (first try included).
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default pause between connection attempts.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay backoff allowing `max_attempts` attempts in total.
///
/// `backon` counts retries, not attempts, so the first try is subtracted.
pub fn connection_backoff(max_attempts: u32, delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(max_attempts.saturating_sub(1) as usize)
}
