//! Leader viability tracking and redirect handling (spec §4.G). Starts
//! not-viable; `pings_to_viable` (default 4) consecutive clean ping
//! replies from the believed leader flip it viable. Supplemented from
//! `examples/original_source/src/raft_client.c` (not in the distilled
//! spec): the staleness check compares the last ping *sent* against the
//! last ping *acknowledged*, not a single last-contact timestamp, so we
//! keep both timestamps rather than collapsing to one "stale_server_time".

use std::time::{Duration, Instant};

use uuid::Uuid;

/// Transport-level outcome of a ping RPC, used to decide what a reply (or
/// its absence) means for the believed leader (spec §4.G, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Ok,
    /// `EAGAIN`/`EBUSY`/`EINPROGRESS`: transient, resets the alive counter only.
    Busy,
    /// `ENOENT`/`ENOSYS`: also forget the leader.
    Gone,
}

pub struct LeaderView {
    pub peer: Uuid,
    pub last_ping_sent: Option<Instant>,
    pub last_ping_ackd: Option<Instant>,
    alive_count: u32,
}

impl LeaderView {
    fn new(peer: Uuid) -> Self {
        LeaderView {
            peer,
            last_ping_sent: None,
            last_ping_ackd: None,
            alive_count: 0,
        }
    }
}

pub struct Viability {
    pings_to_viable: u32,
    stale_server_ms: u64,
    believed_leader: Option<LeaderView>,
    viable: bool,
    /// Peers ordered by how recently they've responded to anything, most
    /// recent first — "most-recently-responsive peer" (spec §4.F/§4.G).
    responsive_peers: Vec<(Uuid, Instant)>,
}

impl Viability {
    pub fn new(pings_to_viable: u32, stale_server_ms: u64) -> Self {
        Viability {
            pings_to_viable,
            stale_server_ms,
            believed_leader: None,
            viable: false,
            responsive_peers: Vec::new(),
        }
    }

    pub fn is_viable(&self) -> bool {
        self.viable
    }

    pub fn believed_leader(&self) -> Option<Uuid> {
        self.believed_leader.as_ref().map(|l| l.peer)
    }

    pub fn record_responsive(&mut self, peer: Uuid, at: Instant) {
        self.responsive_peers.retain(|(p, _)| *p != peer);
        self.responsive_peers.push((peer, at));
    }

    /// Most recently responsive peer other than the believed leader, used
    /// to redirect a ping when the believed leader goes stale.
    pub fn most_responsive_peer(&self) -> Option<Uuid> {
        self.responsive_peers
            .iter()
            .max_by_key(|(_, at)| *at)
            .map(|(p, _)| *p)
    }

    pub fn record_ping_sent(&mut self, at: Instant) {
        if let Some(leader) = &mut self.believed_leader {
            leader.last_ping_sent = Some(at);
        }
    }

    /// True if the believed leader hasn't acknowledged a ping recently
    /// relative to the last one sent (spec supplement: sent-vs-acked gap,
    /// not a single last-contact stamp).
    pub fn is_stale(&self, now: Instant) -> bool {
        match &self.believed_leader {
            None => true,
            Some(leader) => match (leader.last_ping_sent, leader.last_ping_ackd) {
                (Some(sent), ackd) => {
                    let since_ackd = ackd.unwrap_or(sent);
                    now.saturating_duration_since(since_ackd) >= Duration::from_millis(self.stale_server_ms)
                }
                (None, _) => false,
            },
        }
    }

    /// Applies the outcome of a ping reply from `from` (spec §4.G). Only
    /// a reply from the *believed* leader advances the alive counter.
    pub fn on_ping_outcome(&mut self, from: Uuid, outcome: PingOutcome, now: Instant) {
        self.record_responsive(from, now);
        let is_from_believed_leader = self.believed_leader.as_ref().map(|l| l.peer) == Some(from);

        match outcome {
            PingOutcome::Ok => {
                if is_from_believed_leader {
                    if let Some(leader) = &mut self.believed_leader {
                        leader.last_ping_ackd = Some(now);
                        leader.alive_count += 1;
                        if leader.alive_count >= self.pings_to_viable {
                            self.viable = true;
                        }
                    }
                }
            }
            PingOutcome::Busy => {
                if is_from_believed_leader {
                    if let Some(leader) = &mut self.believed_leader {
                        leader.alive_count = 0;
                    }
                    self.viable = false;
                }
            }
            PingOutcome::Gone => {
                if is_from_believed_leader {
                    self.believed_leader = None;
                    self.viable = false;
                }
            }
        }
    }

    /// Adopts `peer` as the believed leader, resetting its alive counter.
    /// `fresh` gates adoption from a `Redirect` envelope (spec §4.G:
    /// "adopts it if fresh") against acting on a stale redirect.
    pub fn adopt_leader(&mut self, peer: Uuid, fresh: bool) {
        if !fresh {
            return;
        }
        if self.believed_leader.as_ref().map(|l| l.peer) != Some(peer) {
            self.believed_leader = Some(LeaderView::new(peer));
            self.viable = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn becomes_viable_after_threshold_clean_pings() {
        let mut v = Viability::new(4, 100);
        let leader = Uuid::new_v4();
        v.adopt_leader(leader, true);
        let now = Instant::now();
        for _ in 0..3 {
            v.on_ping_outcome(leader, PingOutcome::Ok, now);
            assert!(!v.is_viable());
        }
        v.on_ping_outcome(leader, PingOutcome::Ok, now);
        assert!(v.is_viable());
    }

    #[test]
    fn busy_resets_counter_without_forgetting_leader() {
        let mut v = Viability::new(2, 100);
        let leader = Uuid::new_v4();
        v.adopt_leader(leader, true);
        let now = Instant::now();
        v.on_ping_outcome(leader, PingOutcome::Ok, now);
        v.on_ping_outcome(leader, PingOutcome::Busy, now);
        assert_eq!(v.believed_leader(), Some(leader));
        assert!(!v.is_viable());
    }

    #[test]
    fn gone_forgets_the_leader() {
        let mut v = Viability::new(2, 100);
        let leader = Uuid::new_v4();
        v.adopt_leader(leader, true);
        v.on_ping_outcome(leader, PingOutcome::Gone, Instant::now());
        assert_eq!(v.believed_leader(), None);
    }

    #[test]
    fn stale_redirect_is_ignored() {
        let mut v = Viability::new(2, 100);
        let leader = Uuid::new_v4();
        v.adopt_leader(leader, true);
        v.adopt_leader(Uuid::new_v4(), false);
        assert_eq!(v.believed_leader(), Some(leader));
    }

    #[test]
    fn staleness_compares_sent_against_ackd() {
        let mut v = Viability::new(2, 50);
        let leader = Uuid::new_v4();
        v.adopt_leader(leader, true);
        let t0 = Instant::now();
        v.record_ping_sent(t0);
        assert!(!v.is_stale(t0));
        assert!(v.is_stale(t0 + Duration::from_millis(60)));
    }
}
