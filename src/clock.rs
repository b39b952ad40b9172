//! Time source and the polling primitive used by the wait operations.
//!
//! Polls never bound their own wall-clock duration. A poll ends when the
//! condition holds or when its ledger deadline has passed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Wall clock plus a way to wait, injectable so tests can drive time from a
/// simulated ledger.
pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

/// The host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Result of one poll iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// Condition satisfied.
    Ready(T),
    /// Not yet; sleep and try again.
    Pending,
    /// Deadline passed; stop without error.
    Expired,
}

/// Run `step` every `interval` until it reports `Ready` or `Expired`.
///
/// Transient errors ([`crate::Error::is_transient`]) are logged and retried
/// after the interval. Any other error ends the poll.
pub fn poll<T, F>(clock: &dyn Clock, interval: Duration, label: &str, mut step: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<PollStatus<T>>,
{
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match step() {
            Ok(PollStatus::Ready(value)) => {
                log::debug!("poll: {label} ready after {attempts} attempts");
                return Ok(Some(value));
            }
            Ok(PollStatus::Expired) => {
                log::info!("poll: {label} expired after {attempts} attempts");
                return Ok(None);
            }
            Ok(PollStatus::Pending) => {}
            Err(e) if e.is_transient() => {
                log::warn!("poll: {label} attempt {attempts} failed ({e}), retrying in {interval:?}");
            }
            Err(e) => return Err(e),
        }
        clock.sleep(interval);
    }
}
