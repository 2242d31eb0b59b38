//! Per-provider request smoothing.
//!
//! Rather than letting a worker burst through its budget and then block for
//! the rest of the window, [`RateLimiter::sleep_time`] spreads the remaining
//! budget evenly over the remaining window.
//!
//! ```text
//! window:  |fixture ---------------------------- fixture + rate_period|
//! request:  ^ 0s   ^ (remaining_time / remaining_requests)  ...  ^ wait for reset
//! ```
//!
//! The limiter is approximate. It assumes it is called *after* each request
//! and the first request of a fresh window is counted in the old one as well,
//! so callers that ignore its suggestions can exceed the budget around window
//! boundaries.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct RateLimiterInner {
    fixture: Option<Instant>,
    request_count: u64,
}

/// Thread-safe request smoother shared by every worker of one provider.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate_period: Duration,
    /// Configured limit plus one unit of slack.
    rate_limit: u64,
    inner: Arc<Mutex<RateLimiterInner>>,
}

impl RateLimiter {
    /// Allow roughly `rate_limit` requests per `rate_period`.
    pub fn new(rate_limit: u32, rate_period: Duration) -> Self {
        Self {
            rate_period,
            rate_limit: u64::from(rate_limit) + 1,
            inner: Arc::new(Mutex::new(RateLimiterInner {
                fixture: None,
                request_count: 0,
            })),
        }
    }

    /// The configured limit, without the slack unit.
    pub fn rate_limit(&self) -> u32 {
        u32::try_from(self.rate_limit - 1).unwrap_or(u32::MAX)
    }

    pub fn request_count(&self) -> u64 {
        self.lock_inner().request_count
    }

    fn lock_inner(&self) -> MutexGuard<'_, RateLimiterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    /// Record a request and return how long to wait before the next one.
    pub fn sleep_time(&self) -> Duration {
        self.sleep_time_at(Instant::now())
    }

    fn sleep_time_at(&self, now: Instant) -> Duration {
        let mut inner = self.lock_inner();
        inner.request_count += 1;

        let fixture = match inner.fixture {
            Some(fixture) => fixture,
            None => {
                inner.fixture = Some(now);
                return Duration::ZERO;
            }
        };

        let reset_at = fixture + self.rate_period;
        if now > reset_at {
            inner.fixture = Some(now);
            inner.request_count = 1;
            return Duration::ZERO;
        }

        self.spacing(reset_at - now, inner.request_count)
    }

    /// How long the next request should wait, without recording one.
    pub fn wait_time(&self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    fn wait_time_at(&self, now: Instant) -> Duration {
        let inner = self.lock_inner();
        let Some(fixture) = inner.fixture else {
            return Duration::ZERO;
        };

        let reset_at = fixture + self.rate_period;
        if now > reset_at {
            return Duration::ZERO;
        }

        self.spacing(reset_at - now, inner.request_count)
    }

    fn spacing(&self, remaining_time: Duration, request_count: u64) -> Duration {
        let remaining_requests = self.rate_limit.saturating_sub(request_count);
        if remaining_requests == 0 {
            return remaining_time;
        }

        remaining_time.div_f64(remaining_requests as f64)
    }
}
