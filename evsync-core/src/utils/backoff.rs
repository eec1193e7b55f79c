use std::time::Duration;

/// Largest exponent applied to the base delay (`base * 2^9`).
const MAX_BACKOFF_EXPONENT: u32 = 9;

/// Calculate the next retry delay based on retry count.
///
/// Uses exponential backoff: `base * 2^retry_count`.
pub fn calculate_retry_delay(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(2u32.pow(retry_count.min(MAX_BACKOFF_EXPONENT)))
}
