use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Outcome of a limiter check. `retry_after_seconds` is populated only on
/// rejection and is always at least one second.
#[derive(Clone, Debug)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_seconds: Option<u64>,
}

/// Non-mutating view of an identity's current window.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RateLimitUsage {
    pub count: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct RateWindow {
    count: u32,
    window_end: DateTime<Utc>,
}

/// Fixed-window request counter keyed by caller identity.
///
/// Windows never slide: a fresh `{count: 0, window_end: now + window}` entry
/// replaces any expired one on first touch, and the request that would exceed
/// `max` is rejected without incrementing. The check-then-increment runs under
/// the limiter mutex, so concurrent checks on one key cannot both pass the
/// boundary.
pub struct FixedWindowLimiter {
    window_ms: u64,
    max: u32,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(window_ms: u64, max: u32) -> Self {
        Self {
            window_ms: window_ms.max(1),
            max: max.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn fresh_window(&self, now: DateTime<Utc>) -> RateWindow {
        RateWindow {
            count: 0,
            window_end: now + Duration::milliseconds(self.window_ms as i64),
        }
    }

    pub async fn check(&self, identity: &str) -> RateLimitDecision {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(identity.to_string())
            .or_insert_with(|| self.fresh_window(now));
        if window.window_end <= now {
            *window = self.fresh_window(now);
        }

        if window.count >= self.max {
            let remaining_ms = (window.window_end - now).num_milliseconds().max(0) as u64;
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: window.window_end,
                retry_after_seconds: Some(remaining_ms.div_ceil(1_000).max(1)),
            };
        }

        window.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.max - window.count,
            reset_at: window.window_end,
            retry_after_seconds: None,
        }
    }

    /// Administrative override: forget everything known about an identity.
    pub async fn reset(&self, identity: &str) {
        self.windows.lock().await.remove(identity);
    }

    pub async fn usage(&self, identity: &str) -> RateLimitUsage {
        let now = Utc::now();
        let windows = self.windows.lock().await;
        match windows.get(identity) {
            Some(window) if window.window_end > now => RateLimitUsage {
                count: window.count,
                remaining: self.max.saturating_sub(window.count),
                reset_at: window.window_end,
            },
            _ => RateLimitUsage {
                count: 0,
                remaining: self.max,
                reset_at: now + Duration::milliseconds(self.window_ms as i64),
            },
        }
    }

    /// Drop every expired window so idle keys do not accumulate. Runs from the
    /// periodic sweep task, independent of access patterns.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| window.window_end > now);
        before - windows.len()
    }

    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::FixedWindowLimiter;

    #[tokio::test]
    async fn hundred_calls_pass_then_the_next_is_rejected() {
        let limiter = FixedWindowLimiter::new(60_000, 100);
        let identity = "fixflow_203.0.113.5";

        for call in 0..100 {
            let decision = limiter.check(identity).await;
            assert!(decision.allowed, "call {call} should be allowed");
            assert_eq!(decision.remaining, 99 - call);
        }

        let rejected = limiter.check(identity).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        let retry_after = rejected.retry_after_seconds.expect("retry_after on reject");
        assert!((1..=60).contains(&retry_after));

        // The rejected call must not have incremented the window.
        let usage = limiter.usage(identity).await;
        assert_eq!(usage.count, 100);
    }

    #[tokio::test]
    async fn a_new_window_opens_after_expiry() {
        let limiter = FixedWindowLimiter::new(100, 1);
        assert!(limiter.check("caller").await.allowed);
        assert!(!limiter.check("caller").await.allowed);

        tokio::time::sleep(StdDuration::from_millis(150)).await;
        assert!(limiter.check("caller").await.allowed);
    }

    #[tokio::test]
    async fn usage_does_not_mutate_and_defaults_to_a_fresh_view() {
        let limiter = FixedWindowLimiter::new(60_000, 10);

        let fresh = limiter.usage("quiet").await;
        assert_eq!(fresh.count, 0);
        assert_eq!(fresh.remaining, 10);

        limiter.check("quiet").await;
        let after_one = limiter.usage("quiet").await;
        assert_eq!(after_one.count, 1);
        assert_eq!(limiter.usage("quiet").await.count, 1);
    }

    #[tokio::test]
    async fn reset_reopens_a_saturated_identity() {
        let limiter = FixedWindowLimiter::new(60_000, 1);
        limiter.check("admin-1").await;
        assert!(!limiter.check("admin-1").await.allowed);

        limiter.reset("admin-1").await;
        assert!(limiter.check("admin-1").await.allowed);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_windows() {
        let limiter = FixedWindowLimiter::new(50, 5);
        limiter.check("stale").await;
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        limiter.check("live").await;

        assert_eq!(limiter.sweep_expired().await, 1);
        assert_eq!(limiter.usage("live").await.count, 1);
    }

    #[tokio::test]
    async fn identities_are_counted_independently() {
        let limiter = FixedWindowLimiter::new(60_000, 1);
        assert!(limiter.check("a").await.allowed);
        assert!(limiter.check("b").await.allowed);
        assert!(!limiter.check("a").await.allowed);
    }
}
