use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;

/// The physical clock the scheduler uses for sweep spacing, reload spacing,
/// retry sleeps, and rate limiting. Injected so tests control time.
#[async_trait]
pub trait SystemClock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Suspends the calling task for `duration`. Uninterruptible; callers
    /// that need a deadline race this against another future.
    async fn sleep(&self, duration: Duration);
}

pub struct DefaultSystemClock {
    last_tick: AtomicI64,
}

impl Default for DefaultSystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultSystemClock {
    pub fn new() -> Self {
        Self {
            last_tick: AtomicI64::new(i64::MIN),
        }
    }
}

#[async_trait]
impl SystemClock for DefaultSystemClock {
    fn now(&self) -> SystemTime {
        // SystemTime is not guaranteed to be monotonic, so enforce it here
        let tick = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        self.last_tick.fetch_max(tick, Ordering::SeqCst);
        let millis = self.last_tick.load(Ordering::SeqCst);
        if millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(millis as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
