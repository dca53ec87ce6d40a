//! Minimum-interval rate limiter for reasoning calls.
//!
//! The lock is held across the wait, so checking the last call and
//! stamping the new one is a single critical section: two concurrent
//! callers can never both pass inside one interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_call: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    /// Allow at most `calls_per_minute` acquisitions per minute.
    pub fn per_minute(calls_per_minute: u32) -> Self {
        let interval = Duration::from_secs_f64(60.0 / f64::from(calls_per_minute.max(1)));
        Self::with_interval(interval)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the interval since the previous call has elapsed, then
    /// claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            let now = Instant::now();
            if ready_at > now {
                debug!("Rate limiter waiting {:?}", ready_at - now);
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
