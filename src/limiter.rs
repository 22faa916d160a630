//! Sliding-window rate limiting per caller.
//!
//! Each caller owns a window of recent admission timestamps behind its own
//! lock; the outer map lock is only held to find or create that window.

use crate::config::RateLimitConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Admission timestamps for one caller, oldest first.
#[derive(Debug, Default)]
struct RateWindow {
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Drop timestamps that have left the window ending at `now`.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-caller sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: RwLock<HashMap<String, Arc<Mutex<RateWindow>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an attempt by `caller` now. Returns `false` when over the limit.
    pub fn allow(&self, caller: &str) -> bool {
        self.allow_at(caller, Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading.
    ///
    /// Rejected attempts are not recorded.
    pub fn allow_at(&self, caller: &str, now: Instant) -> bool {
        let window = self.window_for(caller);
        let mut window = window.lock();
        window.prune(now, self.window);

        if window.stamps.len() >= self.max_requests {
            debug!(
                "Rate limit hit for caller {} ({} requests in {:?})",
                caller,
                window.stamps.len(),
                self.window
            );
            return false;
        }

        window.stamps.push_back(now);
        true
    }

    /// Attempts `caller` may still make at `now` without being rejected.
    pub fn remaining_at(&self, caller: &str, now: Instant) -> usize {
        let Some(window) = self.windows.read().get(caller).cloned() else {
            return self.max_requests;
        };
        let mut window = window.lock();
        window.prune(now, self.window);
        self.max_requests.saturating_sub(window.stamps.len())
    }

    /// Number of distinct callers seen so far.
    pub fn tracked_callers(&self) -> usize {
        self.windows.read().len()
    }

    fn window_for(&self, caller: &str) -> Arc<Mutex<RateWindow>> {
        if let Some(window) = self.windows.read().get(caller) {
            return window.clone();
        }
        self.windows
            .write()
            .entry(caller.to_string())
            .or_default()
            .clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixth_call_rejected_until_window_passes() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("test_user", start));
        }
        assert!(!limiter.allow_at("test_user", start));
        assert!(!limiter.allow_at("test_user", start + Duration::from_secs(59)));
        assert!(limiter.allow_at("test_user", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.allow_at("a", start));
        assert!(limiter.allow_at("a", start + Duration::from_secs(5)));
        for offset in 6..10 {
            assert!(!limiter.allow_at("a", start + Duration::from_secs(offset)));
        }

        // Only the first admission has expired; rejected attempts left no trace.
        assert!(limiter.allow_at("a", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("a", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_callers_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_at("alice", now));
        assert!(!limiter.allow_at("alice", now));
        assert!(limiter.allow_at("bob", now));
        assert_eq!(limiter.tracked_callers(), 2);
    }

    #[test]
    fn test_remaining() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.remaining_at("carol", now), 3);
        limiter.allow_at("carol", now);
        assert_eq!(limiter.remaining_at("carol", now), 2);
        assert_eq!(limiter.remaining_at("carol", now + Duration::from_secs(60)), 3);
    }

    #[test]
    fn test_concurrent_callers_never_overcount() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let caller = if i % 2 == 0 { "even" } else { "odd" };
                    (0..10).filter(|_| limiter.allow(caller)).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }
}
