//! Retry scheduler (spec §4.G): a periodic timer, default 10 ms, that
//! scans the sub-app table and re-enqueues anything idle and stale.

use std::time::{Duration, Instant};

use crate::table::SubAppTable;

pub struct RetryScheduler {
    interval: Duration,
    retry_timeout_ms: u64,
    last_scan: Instant,
}

impl RetryScheduler {
    pub fn new(interval: Duration, retry_timeout_ms: u64) -> Self {
        RetryScheduler {
            interval,
            retry_timeout_ms,
            last_scan: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a scan if `interval` has elapsed since the last one. Returns
    /// the number of entries re-enqueued, or `None` if it wasn't yet time.
    pub fn tick(&mut self, now: Instant, table: &SubAppTable) -> Option<usize> {
        if now.saturating_duration_since(self.last_scan) < self.interval {
            return None;
        }
        self.last_scan = now;
        Some(table.retry_scan(self.retry_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subapp::Completion;
    use crate::subapp::SubAppKey;
    use uuid::Uuid;

    #[test]
    fn does_not_scan_before_the_interval_elapses() {
        let table = SubAppTable::new(8);
        let mut sched = RetryScheduler::new(Duration::from_millis(50), 0);
        assert_eq!(sched.tick(Instant::now(), &table), None);
    }

    #[test]
    fn scans_and_requeues_stale_idle_entries() {
        let table = SubAppTable::new(8);
        let key = SubAppKey::new(Uuid::new_v4(), [0, 0, 0, 0]);
        let app = table.submit(key, vec![], 64, 1, Completion::Blocking).unwrap();
        table.submit_enqueue(&app);
        table.dequeue_ready_to_send().unwrap();

        let mut sched = RetryScheduler::new(Duration::from_millis(0), 0);
        let requeued = sched.tick(Instant::now() + Duration::from_millis(1), &table).unwrap();
        assert_eq!(requeued, 1);
        assert!(table.dequeue_ready_to_send().is_some());
    }
}
