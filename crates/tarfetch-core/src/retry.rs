//! Fixed-delay retry for fetch attempts

use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;

use crate::error::FetchError;
use crate::shutdown::StopSignal;

/// Run `attempt_fn` up to `attempts` times, sleeping `delay` between tries.
///
/// No backoff and no jitter. The sleep is cut short if `stop` fires, in which
/// case the last error is returned without further attempts.
pub fn retry_fixed<T>(
    label: &str,
    attempts: u32,
    delay: Duration,
    stop: &StopSignal,
    mut attempt_fn: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut attempt = 1u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_retryable() => {
                log::debug!("{label}: attempt {attempt}/{attempts} failed: {e}, retrying...");
                attempt += 1;
                if let Err(RecvTimeoutError::Disconnected) = stop.receiver().recv_timeout(delay) {
                    return Err(e);
                }
            }
            Err(e) => {
                log::debug!("{label}: giving up after {attempt} attempts: {e}");
                return Err(e);
            }
        }
    }
}
