/*!
 * Utility functions and helpers for ClimaFlow.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The output of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| Error::timeout(format!("Operation timed out after {:?}", duration)))
}

/// Delay before the next attempt after `consecutive_failures` failed attempts.
///
/// Up to one failure yields `base`; every further failure doubles the delay,
/// never exceeding `max`.
pub fn backoff_delay(base: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    if consecutive_failures <= 1 {
        return base;
    }
    let exponent = (consecutive_failures - 1).min(16);
    base.saturating_mul(1u32 << exponent).min(max.max(base))
}
