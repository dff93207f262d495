//! Single-subnet token-bucket rate admission (§4.1).

use parking_lot::Mutex;
use web_time::Instant;

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

/// A refill-rate + burst-capacity token bucket, internally synchronized so it
/// can be shared across threads without an outer lock.
pub struct TokenBucket {
    rps: f64,
    burst: f64,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(rps: f64, burst: f64) -> Self {
        Self {
            rps,
            burst,
            inner: Mutex::new(Inner {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills by elapsed time, then takes one token if available.
    pub fn take(&self) -> bool {
        self.take_at(Instant::now())
    }

    /// Like [`Self::take`] but with an explicit `now`, for deterministic tests.
    pub fn take_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let elapsed = now.saturating_duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rps).min(self.burst);
        inner.last_refill = now;

        if inner.tokens < 1.0 {
            return false;
        }
        inner.tokens -= 1.0;
        true
    }

    pub fn last_refill(&self) -> Instant {
        self.inner.lock().last_refill
    }

    pub fn tokens(&self) -> f64 {
        self.inner.lock().tokens
    }

    pub fn rps(&self) -> f64 {
        self.rps
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }
}
