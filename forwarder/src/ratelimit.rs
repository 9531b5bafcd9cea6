//! Token-bucket admission control.

use parking_lot::Mutex;
use tokio::time::Instant;

/// A single shared token bucket: `burst` capacity, refilled at
/// `requests_per_second`. No per-client partitioning.
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_second: f64,
    burst: f64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: f64,
    refreshed: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst: f64::from(burst),
            state: Mutex::new(State {
                tokens: f64::from(burst),
                refreshed: Instant::now(),
            }),
        }
    }

    /// Admits or rejects one request.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.refreshed);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.requests_per_second).min(self.burst);
        state.refreshed = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
