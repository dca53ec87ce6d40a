//! Rolling-window crash counter for the rollback breaker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CrashTracker {
    threshold: usize,
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl CrashTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now`. Returns true when `threshold` crashes fall
    /// inside the window; the counter is then cleared.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);
        if self.crashes.len() >= self.threshold {
            self.crashes.clear();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.crashes.clear();
    }

    pub fn count(&self) -> usize {
        self.crashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_third_crash_inside_window() {
        let mut t = CrashTracker::new(3, Duration::from_secs(60));
        let start = Instant::now();
        assert!(!t.record(start));
        assert!(!t.record(start + Duration::from_secs(10)));
        assert!(t.record(start + Duration::from_secs(20)));
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn old_crashes_age_out() {
        let mut t = CrashTracker::new(3, Duration::from_secs(60));
        let start = Instant::now();
        assert!(!t.record(start));
        assert!(!t.record(start + Duration::from_secs(30)));
        assert!(!t.record(start + Duration::from_secs(70)));
        assert_eq!(t.count(), 2);
        assert!(t.record(start + Duration::from_secs(80)));
    }

    #[test]
    fn reset_clears() {
        let mut t = CrashTracker::new(2, Duration::from_secs(60));
        let now = Instant::now();
        t.record(now);
        t.reset();
        assert!(!t.record(now));
    }
}
