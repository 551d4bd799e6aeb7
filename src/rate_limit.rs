//! Adaptive process-wide rate limiting for the transcript oracle.
//!
//! A single token bucket gates every fetcher call. A 429 from the
//! provider halves the rate; the first success after a retreat doubles it
//! back, never exceeding the configured budget.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter as GovRateLimiter};

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Inner {
    per_minute: u32,
    retreated: bool,
    limiter: Arc<DirectLimiter>,
}

/// Process-wide adaptive token bucket.
pub struct AdaptiveLimiter {
    configured_per_minute: u32,
    inner: Mutex<Inner>,
    jitter: Jitter,
}

fn build(per_minute: u32) -> Arc<DirectLimiter> {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("nonzero"));
    Arc::new(GovRateLimiter::direct(quota))
}

impl AdaptiveLimiter {
    /// Create a limiter for `qps` queries/second against one provider.
    pub fn new(qps: u32) -> Self {
        let per_minute = qps.max(1).saturating_mul(60);
        Self {
            configured_per_minute: per_minute,
            inner: Mutex::new(Inner {
                per_minute,
                retreated: false,
                limiter: build(per_minute),
            }),
            jitter: Jitter::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    /// Wait until a request token is available.
    pub async fn acquire(&self) {
        // Clone the limiter out of the lock so a rate change mid-wait only
        // affects subsequent acquisitions.
        let limiter = {
            let inner = self.inner.lock().expect("limiter lock");
            inner.limiter.clone()
        };
        limiter.until_ready_with_jitter(self.jitter).await;
    }

    /// Provider returned 429: halve the rate (floor 1/min).
    pub fn on_rate_limited(&self) {
        let mut inner = self.inner.lock().expect("limiter lock");
        let halved = (inner.per_minute / 2).max(1);
        if halved != inner.per_minute {
            log::warn!(
                "Oracle rate limited: reducing budget {}/min -> {}/min",
                inner.per_minute,
                halved
            );
            inner.per_minute = halved;
            inner.limiter = build(halved);
        }
        inner.retreated = true;
    }

    /// Provider call succeeded: if retreated, double back toward the
    /// configured budget.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("limiter lock");
        if !inner.retreated {
            return;
        }
        let doubled = inner
            .per_minute
            .saturating_mul(2)
            .min(self.configured_per_minute);
        if doubled != inner.per_minute {
            log::info!(
                "Oracle recovered: restoring budget {}/min -> {}/min",
                inner.per_minute,
                doubled
            );
            inner.per_minute = doubled;
            inner.limiter = build(doubled);
        }
        if inner.per_minute == self.configured_per_minute {
            inner.retreated = false;
        }
    }

    /// Current effective budget in requests/minute (for diagnostics).
    pub fn current_per_minute(&self) -> u32 {
        self.inner.lock().expect("limiter lock").per_minute
    }
}
