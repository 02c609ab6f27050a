//! Byte-rate throttling for compaction I/O.
//!
//! Each compaction service owns one [`RateLimiter`] shared by all of its
//! internal executors, so a service-level limit applies across worker
//! groups. The limit is mutable in place: configuration reloads change the
//! rate without touching jobs already running.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::clock::SystemClock;

/// Token bucket over bytes per second with a one-second burst.
///
/// Acquire never rejects; a caller that outruns the rate takes on debt and
/// sleeps it off, which keeps large single acquisitions (a whole block
/// write) working against small rates. A rate of zero means unlimited.
pub struct RateLimiter {
    clock: Arc<dyn SystemClock>,
    state: Mutex<BucketState>,
}

struct BucketState {
    rate: u64,
    available: f64,
    last_refill: SystemTime,
}

impl RateLimiter {
    pub(crate) fn new(rate: u64, clock: Arc<dyn SystemClock>) -> Self {
        let last_refill = clock.now();
        Self {
            clock,
            state: Mutex::new(BucketState {
                rate,
                available: rate as f64,
                last_refill,
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate
    }

    pub(crate) fn set_rate(&self, rate: u64) {
        let mut state = self.state.lock();
        state.rate = rate;
        state.available = state.available.min(rate as f64);
    }

    /// Takes `bytes` tokens, sleeping off any debt this acquisition incurs.
    pub async fn acquire(&self, bytes: u64) {
        let wait = {
            let mut state = self.state.lock();
            if state.rate == 0 {
                return;
            }
            let now = self.clock.now();
            let elapsed = now
                .duration_since(state.last_refill)
                .unwrap_or_default()
                .as_secs_f64();
            state.last_refill = now;
            let rate = state.rate as f64;
            state.available = (state.available + elapsed * rate).min(rate);
            state.available -= bytes as f64;
            if state.available >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-state.available / rate))
            }
        };
        if let Some(wait) = wait {
            self.clock.sleep(wait).await;
        }
    }
}
