//! Backoff for the scheduler loop.
//!
//! A single bad tablet or dependency must not spin the loop hot or flood the
//! log. Waits grow geometrically from one increment up to the full sweep
//! interval; failure logging is throttled to warn once per interval with the
//! rest at debug. The loop replaces a fired policy with a fresh one after
//! its first clean pass.

use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::clock::SystemClock;
use crate::error::Error;
use crate::types::TabletExtent;

const BACKOFF_FACTOR: f64 = 1.07;
const LOG_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct RetryPolicy {
    current_wait: Duration,
    increment: Duration,
    max_wait: Duration,
    retries: u64,
    last_log: Option<SystemTime>,
}

impl RetryPolicy {
    pub(crate) fn new(initial_wait: Duration, increment: Duration, max_wait: Duration) -> Self {
        Self {
            current_wait: initial_wait.min(max_wait),
            increment,
            max_wait,
            retries: 0,
            last_log: None,
        }
    }

    pub(crate) fn has_retried(&self) -> bool {
        self.retries > 0
    }

    pub(crate) fn use_retry(&mut self) {
        self.retries += 1;
    }

    /// Logs the failure (throttled) and sleeps the current wait, then grows
    /// it by at least one increment and at least the backoff factor, capped
    /// at the max wait.
    pub(crate) async fn wait_for_next_attempt(
        &mut self,
        clock: &dyn SystemClock,
        extent: Option<&TabletExtent>,
        error: &Error,
    ) {
        let now = clock.now();
        let should_warn = self
            .last_log
            .map_or(true, |last| {
                now.duration_since(last).unwrap_or_default() >= LOG_INTERVAL
            });
        let extent_str = extent.map(|e| e.to_string()).unwrap_or_default();
        if should_warn {
            warn!(
                "Failed to compact {} (attempt {}), sleeping {:?} [error={}]",
                extent_str, self.retries, self.current_wait, error
            );
            self.last_log = Some(now);
        } else {
            debug!(
                "Failed to compact {} (attempt {}), sleeping {:?} [error={}]",
                extent_str, self.retries, self.current_wait, error
            );
        }

        clock.sleep(self.current_wait).await;

        let grown = self
            .current_wait
            .mul_f64(BACKOFF_FACTOR)
            .max(self.current_wait + self.increment);
        self.current_wait = grown.min(self.max_wait);
    }

    #[cfg(test)]
    pub(crate) fn current_wait(&self) -> Duration {
        self.current_wait
    }
}
