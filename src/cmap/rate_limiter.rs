use std::time::Instant;

/// Token bucket governing how quickly a pool may open new connections to its server.
///
/// Tokens accrue at `fill_rate` per second up to `capacity`; establishing a connection consumes
/// one token. Checkout requests that arrive while the bucket is empty sit in the pool's wait
/// queue up to the configured depth, after which they are rejected outright.
#[derive(Debug)]
pub(super) struct IngressRateLimiter {
    capacity: f64,
    fill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl IngressRateLimiter {
    pub(super) fn new(rate_per_sec: u32, burst_capacity_secs: u32) -> Self {
        let fill_rate = f64::from(rate_per_sec.max(1));
        let capacity = (fill_rate * f64::from(burst_capacity_secs.max(1))).max(1.0);
        Self {
            capacity,
            fill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if one is available.
    pub(super) fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::IngressRateLimiter;

    #[test]
    fn burst_then_empty() {
        let mut limiter = IngressRateLimiter::new(20, 1);
        let granted = (0..100).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 20);
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let mut limiter = IngressRateLimiter::new(1000, 1);
        while limiter.try_acquire() {}
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(limiter.try_acquire());
    }
}
