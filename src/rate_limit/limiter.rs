//! Warm-up token bucket
//!
//! Permits are handed out at evenly spaced instants. A change of the target
//! rate is not applied as a step: the effective rate moves linearly from the
//! rate in force at the time of the change to the new target over the warm-up
//! period. A new limiter starts cold, at a third of its target.

use crate::migration::telemetry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const COLD_FACTOR: f64 = 3.0;
const MIN_RATE: f64 = 0.001;

#[derive(Debug)]
struct Ramp {
    from_rate: f64,
    to_rate: f64,
    started: Instant,
    /// Earliest instant the next permit may be handed out
    next_free: Instant,
}

impl Ramp {
    fn rate_at(&self, now: Instant, warmup: Duration) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if warmup.is_zero() || elapsed >= warmup {
            return self.to_rate;
        }
        let progress = elapsed.as_secs_f64() / warmup.as_secs_f64();
        self.from_rate + (self.to_rate - self.from_rate) * progress
    }
}

/// Token bucket admitting at most `rate` permits per second
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    /// Target rate as f64 bits, readable without the lock
    target: AtomicU64,
    warmup: Duration,
    ramp: Mutex<Ramp>,
}

impl RateLimiter {
    /// Create a limiter that warms up to `rate` permits per second
    pub fn new(name: &'static str, rate: f64, warmup: Duration) -> Self {
        let rate = rate.max(MIN_RATE);
        let from_rate = if warmup.is_zero() {
            rate
        } else {
            (rate / COLD_FACTOR).max(MIN_RATE)
        };
        let now = Instant::now();
        telemetry::record_rate(name, rate);
        Self {
            name,
            target: AtomicU64::new(rate.to_bits()),
            warmup,
            ramp: Mutex::new(Ramp {
                from_rate,
                to_rate: rate,
                started: now,
                next_free: now,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Target rate the limiter is moving towards
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.target.load(Ordering::Acquire))
    }

    /// Rate in force right now, somewhere on the warm-up ramp
    pub fn current_rate(&self) -> f64 {
        self.ramp.lock().rate_at(Instant::now(), self.warmup)
    }

    /// Move towards a new target rate over the warm-up period
    pub fn set_rate(&self, rate: f64) {
        let rate = rate.max(MIN_RATE);
        if (self.rate() - rate).abs() < f64::EPSILON {
            return;
        }
        let now = Instant::now();
        {
            let mut ramp = self.ramp.lock();
            ramp.from_rate = ramp.rate_at(now, self.warmup);
            ramp.to_rate = rate;
            ramp.started = now;
        }
        self.target.store(rate.to_bits(), Ordering::Release);
        telemetry::record_rate(self.name, rate);
    }

    /// Wait for one permit
    pub async fn acquire(&self) {
        self.acquire_permits(1).await
    }

    /// Wait for `permits` permits. Never fails; it only delays.
    pub async fn acquire_permits(&self, permits: u32) {
        let wait = self.reserve(permits);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        telemetry::record_rate_limit_wait(self.name, wait.as_secs_f64());
    }

    /// Claim the next free slot and return how long to wait for it
    fn reserve(&self, permits: u32) -> Duration {
        let now = Instant::now();
        let mut ramp = self.ramp.lock();
        let rate = ramp.rate_at(now, self.warmup);
        let start = ramp.next_free.max(now);
        ramp.next_free = start + Duration::from_secs_f64(f64::from(permits) / rate);
        start - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_cold_and_reaches_target() {
        let limiter = RateLimiter::new("read", 300.0, Duration::from_secs(30));
        assert!((limiter.current_rate() - 100.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!((limiter.current_rate() - 200.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(limiter.current_rate(), 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_ramps_from_current() {
        let limiter = RateLimiter::new("write", 100.0, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;

        limiter.set_rate(200.0);
        assert_eq!(limiter.rate(), 200.0);
        assert!((limiter.current_rate() - 100.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((limiter.current_rate() - 150.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_are_spaced() {
        let limiter = RateLimiter::new("read", 10.0, Duration::ZERO);
        let start = Instant::now();
        for _ in 0..11 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_permit_acquire_waits_proportionally() {
        let limiter = RateLimiter::new("write", 45.0, Duration::ZERO);
        let start = Instant::now();
        limiter.acquire_permits(45).await;
        limiter.acquire_permits(45).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
