//! Handshake admission limiter — token bucket.
//!
//! Guards the acceptor against reconnect storms (a broker restart makes
//! every agent in the fleet reconnect at once). One token per handshake;
//! an empty bucket means an immediate retryable 429, before any identity
//! decoding happens.

use std::sync::Mutex;
use std::time::Instant;

struct State {
    tokens: f64,
    last_refill: Instant,
}

pub struct HandshakeLimiter {
    state: Mutex<State>,
    rate: f64,
    burst: f64,
}

impl HandshakeLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            state: Mutex::new(State {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate: rate_per_sec,
            burst,
        }
    }

    /// Returns true if one handshake may proceed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("limiter poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_reject() {
        let limiter = HandshakeLimiter::new(100.0, 10.0);
        let mut allowed = 0;
        for _ in 0..20 {
            if limiter.allow() {
                allowed += 1;
            }
        }
        // Burst of 10, no meaningful refill within the loop.
        assert!(allowed >= 10);
        assert!(allowed < 13);
    }

    #[test]
    fn burst_plus_one_sees_a_rejection() {
        let n = 50;
        let limiter = HandshakeLimiter::new(n as f64, n as f64);
        let rejected = (0..n + 1).filter(|_| !limiter.allow()).count();
        assert!(rejected >= 1);
    }

    #[test]
    fn refills_over_time() {
        let limiter = HandshakeLimiter::new(100.0, 5.0);
        while limiter.allow() {}
        assert!(!limiter.allow());

        std::thread::sleep(Duration::from_millis(50));
        // ~5 tokens refilled over 50ms at 100/s.
        assert!(limiter.allow());
    }

    #[test]
    fn evenly_paced_arrivals_are_never_rejected() {
        // Arrivals at exactly the sustained rate never drain the bucket.
        let limiter = HandshakeLimiter::new(20.0, 20.0);
        for n in 0..30 {
            assert!(limiter.allow(), "arrival {n} rejected");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let limiter = HandshakeLimiter::new(1000.0, 3.0);
        std::thread::sleep(Duration::from_millis(20));
        let allowed = (0..10).filter(|_| limiter.allow()).count();
        assert!(allowed <= 4);
    }
}
