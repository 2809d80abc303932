//! Outbound-request rate limiter (spec §4.G): a per-second token budget
//! plus a fixed per-tick micro-batch cap, so one call to `send_pending`
//! neither bursts the whole queue onto the wire nor exceeds the
//! configured `requests_per_sec`. Grounded on `original_source/src/
//! raft_client.c`'s request-pacing loop, which caps how many sub-apps
//! are dequeued per timer tick and leaves the rest queued for the next
//! one (the event-pipe-rescheduling spec.md describes — approximated
//! here by simply not dequeuing them yet, since this sub-app table is
//! the same queue a later `tick()` drains).

use std::time::Instant;

pub struct RateLimiter {
    requests_per_sec: u32,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_sec: u32, burst: u32) -> Self {
        RateLimiter {
            requests_per_sec,
            burst,
            tokens: requests_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.requests_per_sec as f64).min(self.requests_per_sec as f64);
            self.last_refill = now;
        }
    }

    /// How many items may be drained from the send queue right now:
    /// bounded by both the per-tick micro-batch cap and the remaining
    /// per-second token budget.
    pub fn budget(&mut self, now: Instant) -> u32 {
        self.refill(now);
        (self.tokens.floor() as u32).min(self.burst)
    }

    pub fn consume(&mut self, n: u32) {
        self.tokens = (self.tokens - n as f64).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn budget_is_capped_by_the_micro_batch_size_even_with_full_tokens() {
        let mut rl = RateLimiter::new(1000, 8);
        assert_eq!(rl.budget(Instant::now()), 8);
    }

    #[test]
    fn budget_is_capped_by_remaining_tokens_once_exhausted() {
        let mut rl = RateLimiter::new(10, 8);
        let now = Instant::now();
        rl.consume(10);
        assert_eq!(rl.budget(now), 0);
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut rl = RateLimiter::new(100, 8);
        let now = Instant::now();
        rl.consume(100);
        assert_eq!(rl.budget(now), 0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rl.budget(Instant::now()) > 0);
    }
}
