use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub limited: bool,
    /// Requests counted in the current window, including this one when it
    /// was admitted.
    pub count: usize,
    /// Seconds until the user may try again; zero when not limited.
    pub reset_secs: u64,
}

impl RateCheck {
    fn allowed(count: usize) -> Self {
        Self {
            limited: false,
            count,
            reset_secs: 0,
        }
    }
}

struct Inner {
    window: Duration,
    max_requests: usize,
    admins: HashSet<i64>,
    requests: HashMap<i64, Vec<Instant>>,
}

/// Sliding-window per-user request throttle.
///
/// Admins bypass the limiter entirely. State lives behind a single lock;
/// parameters and the admin set are reconfigurable at runtime.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(
        window_secs: u64,
        max_requests: usize,
        admins: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: Duration::from_secs(window_secs),
                max_requests,
                admins: admins.into_iter().collect(),
                requests: HashMap::new(),
            }),
        }
    }

    pub fn check(&self, user_id: i64) -> RateCheck {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: i64, now: Instant) -> RateCheck {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");

        if inner.admins.contains(&user_id) {
            return RateCheck::allowed(0);
        }

        let window = inner.window;
        let max_requests = inner.max_requests;
        let timestamps = inner.requests.entry(user_id).or_default();
        timestamps.retain(|&t| now.duration_since(t) <= window);

        let count = timestamps.len();
        if count < max_requests {
            timestamps.push(now);
            return RateCheck::allowed(count + 1);
        }

        let oldest = timestamps.iter().min().copied().unwrap_or(now);
        let remaining = (oldest + window).saturating_duration_since(now);
        let reset_secs = remaining.as_secs_f64().ceil() as u64 + 1;
        warn!(
            user_id,
            count,
            window_secs = window.as_secs(),
            "rate limit exceeded"
        );
        RateCheck {
            limited: true,
            count,
            reset_secs,
        }
    }

    /// True when the user has consumed at least 80% of the window budget.
    pub fn near_limit(&self, check: &RateCheck) -> bool {
        let inner = self.inner.lock().expect("rate limiter lock poisoned");
        !check.limited && check.count * 5 >= inner.max_requests * 4
    }

    pub fn reset(&self, user_id: i64) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        if inner.requests.remove(&user_id).is_some() {
            info!(user_id, "rate limit reset");
        }
    }

    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        inner.requests.clear();
        info!("rate limits reset for all users");
    }

    pub fn update_limits(&self, window_secs: Option<u64>, max_requests: Option<usize>) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        if let Some(window_secs) = window_secs {
            inner.window = Duration::from_secs(window_secs);
        }
        if let Some(max_requests) = max_requests {
            inner.max_requests = max_requests;
        }
        info!(
            max_requests = inner.max_requests,
            window_secs = inner.window.as_secs(),
            "rate limits updated"
        );
    }

    pub fn set_admins(&self, admins: impl IntoIterator<Item = i64>) {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        inner.admins = admins.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::RateLimiter;

    #[test]
    fn six_calls_against_a_window_of_three() {
        let limiter = RateLimiter::new(10, 3, []);
        let base = Instant::now();

        for second in 0..3u64 {
            let check = limiter.check_at(1, base + Duration::from_secs(second));
            assert!(!check.limited, "call at t={second} should pass");
            assert_eq!(check.count, second as usize + 1);
            assert_eq!(check.reset_secs, 0);
        }

        for second in 3..6u64 {
            let check = limiter.check_at(1, base + Duration::from_secs(second));
            assert!(check.limited, "call at t={second} should be limited");
            assert_eq!(check.count, 3);
            // Oldest request was at t=0 with a 10s window.
            assert_eq!(check.reset_secs, 10 - second + 1);
        }
    }

    #[test]
    fn window_expiry_readmits_one_request() {
        let limiter = RateLimiter::new(10, 2, []);
        let base = Instant::now();

        assert!(!limiter.check_at(1, base).limited);
        assert!(!limiter.check_at(1, base + Duration::from_secs(1)).limited);
        assert!(limiter.check_at(1, base + Duration::from_secs(2)).limited);

        // The t=0 request has left the window.
        let late = limiter.check_at(1, base + Duration::from_secs(11));
        assert!(!late.limited);
    }

    #[test]
    fn admins_always_pass() {
        let limiter = RateLimiter::new(10, 1, [99]);
        let base = Instant::now();
        for _ in 0..5 {
            let check = limiter.check_at(99, base);
            assert!(!check.limited);
            assert_eq!(check.count, 0);
        }
        // Non-admins are still throttled.
        assert!(!limiter.check_at(1, base).limited);
        assert!(limiter.check_at(1, base).limited);
    }

    #[test]
    fn users_are_throttled_independently() {
        let limiter = RateLimiter::new(10, 1, []);
        let base = Instant::now();
        assert!(!limiter.check_at(1, base).limited);
        assert!(!limiter.check_at(2, base).limited);
        assert!(limiter.check_at(1, base).limited);
    }

    #[test]
    fn reset_clears_one_user() {
        let limiter = RateLimiter::new(10, 1, []);
        let base = Instant::now();
        limiter.check_at(1, base);
        limiter.check_at(2, base);
        assert!(limiter.check_at(1, base).limited);

        limiter.reset(1);
        assert!(!limiter.check_at(1, base).limited);
        assert!(limiter.check_at(2, base).limited);
    }

    #[test]
    fn reset_all_clears_everyone() {
        let limiter = RateLimiter::new(10, 1, []);
        let base = Instant::now();
        limiter.check_at(1, base);
        limiter.check_at(2, base);
        limiter.reset_all();
        assert!(!limiter.check_at(1, base).limited);
        assert!(!limiter.check_at(2, base).limited);
    }

    #[test]
    fn limits_are_reconfigurable_at_runtime() {
        let limiter = RateLimiter::new(10, 1, []);
        let base = Instant::now();
        limiter.check_at(1, base);
        assert!(limiter.check_at(1, base).limited);

        limiter.update_limits(None, Some(5));
        assert!(!limiter.check_at(1, base).limited);

        limiter.set_admins([1]);
        for _ in 0..10 {
            assert!(!limiter.check_at(1, base).limited);
        }
    }

    #[test]
    fn near_limit_flags_eighty_percent_usage() {
        let limiter = RateLimiter::new(10, 5, []);
        let base = Instant::now();
        for i in 0..4 {
            let check = limiter.check_at(1, base + Duration::from_secs(i));
            if i < 3 {
                assert!(!limiter.near_limit(&check));
            } else {
                assert!(limiter.near_limit(&check));
            }
        }
    }
}
