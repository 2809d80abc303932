//! Election and heartbeat timers (spec §4.E "Timers"). `rand` supplies the
//! election-timeout jitter, the same crate/idiom used in
//! `examples/cbaugus-rust_loadtest` for randomized pacing.

use std::time::{Duration, Instant};

use rand::Rng;

/// Fires once per random interval in `[min, max]`; rearmed on every valid
/// leader append, vote grant, or self-vote (spec §4.E).
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let mut timer = ElectionTimer {
            min,
            max,
            deadline: Instant::now(),
        };
        timer.rearm();
        timer
    }

    pub fn rearm(&mut self) {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis().max(min_ms as u128 + 1) as u64;
        let jittered = rand::thread_rng().gen_range(min_ms..max_ms);
        self.deadline = Instant::now() + Duration::from_millis(jittered);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Periodic heartbeat interval, active only while Leader (spec §4.E:
/// `it_interval == it_value`, i.e. a true fixed-period timer, not
/// jittered).
pub struct HeartbeatTimer {
    interval: Duration,
    deadline: Instant,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        HeartbeatTimer {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    pub fn rearm(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timer_deadline_falls_within_bounds() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(200));
        let elapsed = timer.deadline().saturating_duration_since(Instant::now());
        assert!(elapsed >= Duration::from_millis(90) && elapsed <= Duration::from_millis(200));
    }

    #[test]
    fn election_timer_rearm_picks_a_new_deadline() {
        let mut timer = ElectionTimer::new(Duration::from_millis(10), Duration::from_millis(11));
        let first = timer.deadline();
        std::thread::sleep(Duration::from_millis(15));
        timer.rearm();
        assert!(timer.deadline() > first);
    }

    #[test]
    fn heartbeat_timer_expires_after_its_interval() {
        let timer = HeartbeatTimer::new(Duration::from_millis(5));
        assert!(!timer.is_expired(Instant::now()));
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.is_expired(Instant::now()));
    }
}
