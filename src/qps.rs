//! Per-backend QPS limiting.
//!
//! A small token bucket: tokens replenish continuously at the configured
//! rate, with the burst capacity equal to the rate. The first-available
//! policy peeks at the bucket with [`QpsLimiter::check_only`] to skip
//! saturated backends; the dispatch path consumes a token with
//! [`QpsLimiter::account`].

use std::time::Instant;

/// Token bucket limiting a backend to `rate` queries per second.
#[derive(Debug)]
pub struct QpsLimiter {
    rate: u32,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

impl QpsLimiter {
    /// Create a limiter allowing `rate` queries per second with an equal burst.
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            burst: rate,
            tokens: f64::from(rate),
            last_refill: Instant::now(),
        }
    }

    /// The configured rate in queries per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * f64::from(self.rate)).min(f64::from(self.burst));
            self.last_refill = now;
        }
    }

    /// Whether a query would currently be admitted, without consuming a token.
    pub fn check_only(&mut self) -> bool {
        self.refill(Instant::now());
        self.tokens >= 1.0
    }

    /// Consume a token for a dispatched query. Returns false when the bucket
    /// was already empty (the query is still dispatched; the cap is advisory).
    pub fn account(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
