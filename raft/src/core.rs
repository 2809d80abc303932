//! The raft protocol state machine (component E, spec §4.E). Pure in the
//! sense that it never touches a socket: handlers take a decoded request
//! and return the envelopes that must be sent as a result, leaving actual
//! datagram I/O to [`crate::net`] and [`crate::server`]. Grounded on
//! `original_source/src/raft.c` for the transition table, vote-tally, and
//! replication bookkeeping; expressed with owned `Result`-returning
//! methods rather than the original's callback-driven dispatch (spec.md
//! §9 "Coroutine control flow").

use uuid::Uuid;

use raft_log::{EntryMeta, LogBackend};
use raft_proto::entry::{Entry, LogHeader};
use raft_proto::ids::{EntryIndex, Term, NO_ENTRY, NO_TERM};
use raft_proto::messages::{AppendReply, AppendRequest, ReplicatedEntry, VoteReply, VoteRequest};

use crate::error::Result;
use crate::state::{CandidateState, LeaderState, Metrics, Role, VoteResult};

/// External collaborator (spec §1: "the embedded key-value engine used by
/// the persistent backend" covers storage; the state machine entries are
/// applied *to* is a separate seam the spec's apply-loop description
/// implies but does not name a backend for). A no-op double is provided
/// for tests and for deployments that only care about the replicated log.
pub trait StateMachine: Send {
    fn apply(&mut self, index: EntryIndex, data: &[u8]) -> Result<()>;
}

pub struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn apply(&mut self, _index: EntryIndex, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Maximum number of entries batched into one `AppendReq` when catching a
/// follower up (bounds both datagram size and per-tick work).
const MAX_REPLICATION_BATCH: usize = 64;

/// One outbound message the caller (the net layer) must serialize and send.
pub enum Outbound {
    VoteRequest(Uuid, VoteRequest),
    VoteReply(Uuid, VoteReply),
    AppendRequest(Uuid, AppendRequest),
    AppendReply(Uuid, AppendReply),
}

pub struct RaftCore {
    self_id: Uuid,
    group_id: Uuid,
    peers: Vec<Uuid>,
    log: Box<dyn LogBackend>,
    state_machine: Box<dyn StateMachine>,

    role: Role,
    current_term: Term,
    voted_for: Option<Uuid>,

    last_log_index: EntryIndex,
    last_log_term: Term,
    commit_idx: EntryIndex,
    last_applied: EntryIndex,
    cumulative_crc: u32,

    candidate_state: Option<CandidateState>,
    leader_state: Option<LeaderState>,

    metrics: Metrics,
}

impl RaftCore {
    pub fn new(
        self_id: Uuid,
        group_id: Uuid,
        peers: Vec<Uuid>,
        mut log: Box<dyn LogBackend>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        let (current_term, voted_for) = match log.header_load() {
            Ok(h) => (h.term, h.voted_for),
            Err(raft_log::LogError::NoValidHeader) => (NO_TERM, None),
            Err(e) => return Err(e.into()),
        };

        log.recover_scan()?;
        let count = log.count_entries()?;
        let (last_log_index, last_log_term) = if count == 0 {
            (NO_ENTRY, NO_TERM)
        } else {
            let lowest = log.lowest_entry_index()?;
            let highest = lowest + count as i64 - 1;
            let meta = log.read_header(highest)?;
            (meta.index, meta.term)
        };

        Ok(RaftCore {
            self_id,
            group_id,
            peers,
            log,
            state_machine,
            role: Role::Follower,
            current_term,
            voted_for,
            last_log_index,
            last_log_term,
            commit_idx: NO_ENTRY,
            last_applied: NO_ENTRY,
            cumulative_crc: 0,
            candidate_state: None,
            leader_state: None,
            metrics: Metrics::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_idx(&self) -> EntryIndex {
        self.commit_idx
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    /// Peer this node believes is leader, for the net layer's "most
    /// recently responsive peer" / redirect support (spec §4.F).
    pub fn believed_leader(&self) -> Option<Uuid> {
        if self.role == Role::Leader {
            Some(self.self_id)
        } else {
            self.voted_for.filter(|_| self.role == Role::Follower)
        }
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn persist_header(&mut self) -> Result<()> {
        let mut header = self.log.header_load().unwrap_or_else(|_| LogHeader::initial());
        header.term = self.current_term;
        header.voted_for = self.voted_for;
        header.seqno = header.seqno.wrapping_add(1);
        self.log.header_write(&header)?;
        Ok(())
    }

    /// Demotes to Follower, recording a strictly greater observed term
    /// (invariant 5: persisted before the term is acted upon further).
    fn step_down(&mut self, new_term: Term) -> Result<()> {
        assert!(new_term >= self.current_term, "term must never decrease");
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.candidate_state = None;
        self.leader_state = None;
        self.persist_header()
    }

    /// Election timer fired (spec §4.E transition table, rows F/C -> C).
    pub fn on_election_timeout(&mut self) -> Result<Vec<Outbound>> {
        self.current_term += 1;
        self.voted_for = Some(self.self_id);
        self.role = Role::Candidate;
        self.persist_header()?;

        self.candidate_state = Some(CandidateState::new(self.current_term, &self.peers, self.self_id));
        self.metrics.votes_accepted += 1;

        let req = VoteRequest {
            proposed_term: self.current_term,
            last_log_term: self.last_log_term,
            last_log_index: self.last_log_index,
        };
        Ok(self
            .peers
            .iter()
            .map(|p| Outbound::VoteRequest(*p, req.clone()))
            .collect())
    }

    pub fn handle_vote_request(&mut self, from: Uuid, req: VoteRequest) -> Result<VoteReply> {
        if req.proposed_term > self.current_term {
            self.step_down(req.proposed_term)?;
        }

        let log_ok = req.last_log_term > self.last_log_term
            || (req.last_log_term == self.last_log_term && req.last_log_index >= self.last_log_index);

        let already_voted_other = matches!(self.voted_for, Some(v) if v != from);
        let grant = req.proposed_term == self.current_term && log_ok && !already_voted_other;

        if grant {
            self.voted_for = Some(from);
            self.persist_header()?;
            if self.role == Role::Candidate {
                self.role = Role::Follower;
                self.candidate_state = None;
            }
        }

        Ok(VoteReply {
            term: self.current_term,
            vote_granted: grant,
        })
    }

    pub fn handle_vote_reply(&mut self, from: Uuid, rep: VoteReply) -> Result<Vec<Outbound>> {
        if rep.term > self.current_term {
            self.step_down(rep.term)?;
            return Ok(vec![]);
        }

        if self.role != Role::Candidate {
            return Ok(vec![]);
        }
        let Some(cs) = self.candidate_state.as_mut() else {
            return Ok(vec![]);
        };
        if cs.term != self.current_term {
            return Ok(vec![]);
        }

        cs.votes.insert(from, if rep.vote_granted { VoteResult::Yes } else { VoteResult::No });
        if rep.vote_granted {
            self.metrics.votes_accepted += 1;
        } else {
            self.metrics.votes_rejected += 1;
        }

        if cs.yes_count() >= self.majority() {
            self.become_leader()?;
            return Ok(self.build_append_round());
        }

        Ok(vec![])
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.candidate_state = None;
        self.leader_state = Some(LeaderState::new(
            &self.peers,
            self.last_log_index,
            self.last_log_term,
            self.commit_idx,
        ));
        Ok(())
    }

    /// Builds one `AppendReq` per peer — empty for an idle peer (a plain
    /// heartbeat) or carrying up to [`MAX_REPLICATION_BATCH`] entries for a
    /// peer behind the leader's log.
    fn build_append_round(&mut self) -> Vec<Outbound> {
        let Some(leader) = self.leader_state.as_ref() else {
            return vec![];
        };
        let mut out = Vec::with_capacity(self.peers.len());
        for peer in self.peers.clone() {
            let next_idx = *leader.next_idx.get(&peer).unwrap_or(&(self.last_log_index + 1));
            let prev_log_index = next_idx - 1;
            let prev_log_term = match leader.prev_term.get(&peer).copied().flatten() {
                Some(t) => t,
                None => self.term_at(prev_log_index).unwrap_or(NO_TERM),
            };

            let mut entries = Vec::new();
            let mut idx = next_idx;
            while idx <= self.last_log_index && entries.len() < MAX_REPLICATION_BATCH {
                if let Ok(entry) = self.log.read_full(idx) {
                    entries.push(ReplicatedEntry {
                        index: entry.index,
                        term: entry.term,
                        data: entry.data,
                    });
                }
                idx += 1;
            }

            let req = AppendRequest {
                term: self.current_term,
                commit_index: self.commit_idx,
                prev_log_index,
                prev_log_term,
                entries,
            };
            self.metrics.append_entries_sent += 1;
            out.push(Outbound::AppendRequest(peer, req));
        }
        out
    }

    fn term_at(&mut self, index: EntryIndex) -> Option<Term> {
        if index == NO_ENTRY {
            return Some(NO_TERM);
        }
        self.log.read_header(index).ok().map(|m: EntryMeta| m.term)
    }

    /// Leader-only: periodic heartbeat / replication tick (spec §4.E
    /// "Replication protocol").
    pub fn heartbeat_tick(&mut self) -> Vec<Outbound> {
        if self.role != Role::Leader {
            return vec![];
        }
        self.build_append_round()
    }

    /// Leader-only client write: appends `data` at the next index in the
    /// current term. Replication to followers happens on the next
    /// heartbeat/replication tick.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<EntryIndex> {
        if self.role != Role::Leader {
            return Err(crate::error::RaftError::NotLeader(self.believed_leader()));
        }
        let index = self.last_log_index + 1;
        let entry = Entry::new(index, self.current_term, self.self_id, self.group_id, data);
        self.log.write(&entry)?;
        self.last_log_index = index;
        self.last_log_term = self.current_term;
        if let Some(leader) = self.leader_state.as_mut() {
            leader.next_idx.insert(self.self_id, index + 1);
            leader.match_idx.insert(self.self_id, index);
        }
        Ok(index)
    }

    pub fn handle_append_request(&mut self, from: Uuid, req: AppendRequest) -> Result<AppendReply> {
        if req.term < self.current_term {
            return Ok(AppendReply {
                term: self.current_term,
                stale_term: true,
                non_matching_prev_term: false,
                last_log_index: self.last_log_index,
            });
        }

        if req.term > self.current_term || self.role == Role::Candidate {
            self.step_down(req.term)?;
        } else {
            self.role = Role::Follower;
        }
        self.metrics.append_entries_received += 1;
        let _ = from;

        if req.prev_log_index != NO_ENTRY {
            let prev_term = self.term_at(req.prev_log_index);
            if prev_term != Some(req.prev_log_term) {
                return Ok(AppendReply {
                    term: self.current_term,
                    stale_term: false,
                    non_matching_prev_term: true,
                    last_log_index: self.last_log_index,
                });
            }
        }

        if !req.entries.is_empty() {
            // Truncate any conflicting suffix, then append in order
            // (spec.md §9 open question 3: standard Raft semantics).
            if req.prev_log_index < self.last_log_index {
                self.log.truncate_to(req.prev_log_index + 1)?;
            }
            let mut idx = req.prev_log_index;
            let mut term = req.prev_log_term;
            for re in &req.entries {
                idx += 1;
                assert_eq!(re.index, idx, "replicated entry index must be contiguous");
                assert!(re.term >= term, "replicated entry term must not regress");
                let entry = Entry::new(re.index, re.term, self.self_id, self.group_id, re.data.clone());
                self.log.write(&entry)?;
                term = re.term;
            }
            self.last_log_index = idx;
            self.last_log_term = term;
        }

        if req.commit_index > self.commit_idx {
            self.commit_idx = req.commit_index.min(self.last_log_index);
            self.apply_committed()?;
        }

        Ok(AppendReply {
            term: self.current_term,
            stale_term: false,
            non_matching_prev_term: false,
            last_log_index: self.last_log_index,
        })
    }

    pub fn handle_append_reply(&mut self, from: Uuid, rep: AppendReply) -> Result<Vec<Outbound>> {
        if rep.term > self.current_term {
            self.step_down(rep.term)?;
            return Ok(vec![]);
        }
        if self.role != Role::Leader {
            return Ok(vec![]);
        }
        if rep.stale_term {
            return Ok(vec![]);
        }

        let Some(leader) = self.leader_state.as_mut() else {
            return Ok(vec![]);
        };

        if rep.non_matching_prev_term {
            let next = leader.next_idx.get(&from).copied().unwrap_or(self.last_log_index + 1);
            leader.next_idx.insert(from, (next - 1).max(0));
            leader.prev_term.insert(from, None);
            return Ok(vec![]);
        }

        leader.next_idx.insert(from, rep.last_log_index + 1);
        leader.match_idx.insert(from, rep.last_log_index);
        let refreshed_term = self.term_at(rep.last_log_index);
        if let Some(leader) = self.leader_state.as_mut() {
            leader.prev_term.insert(from, refreshed_term);
        }

        self.advance_commit_index()?;
        Ok(vec![])
    }

    /// Advances `commit_idx` to the highest index replicated on a majority
    /// whose entry's term equals the current term (spec §4.E; the
    /// "current term" restriction is the standard Raft safety argument
    /// against committing a previous leader's uncommitted entry).
    fn advance_commit_index(&mut self) -> Result<()> {
        let Some(leader) = self.leader_state.as_ref() else {
            return Ok(());
        };
        let mut candidate = self.commit_idx;
        let mut idx = self.commit_idx + 1;
        while idx <= self.last_log_index {
            let mut count = 1; // self
            for peer in &self.peers {
                if leader.match_idx.get(peer).copied().unwrap_or(NO_ENTRY) >= idx {
                    count += 1;
                }
            }
            if count >= self.majority() && self.term_at(idx) == Some(self.current_term) {
                candidate = idx;
            }
            idx += 1;
        }
        if candidate > self.commit_idx {
            self.commit_idx = candidate;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_idx {
            let next = self.last_applied + 1;
            let entry = self.log.read_full(next)?;
            self.state_machine.apply(next, &entry.data)?;
            self.cumulative_crc = crc32c::crc32c_append(self.cumulative_crc, &entry.data);
            self.log.record_applied(next, self.cumulative_crc)?;
            self.last_applied = next;
            self.metrics.entries_applied += 1;
            assert!(self.last_applied <= self.last_log_index, "cannot apply past the logged index");
        }
        assert!(self.commit_idx <= self.last_log_index, "commit_idx must never exceed the logged index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_log::{KvBackend, MemKvEngine};

    fn core(self_id: Uuid, group_id: Uuid, peers: Vec<Uuid>) -> (tempfile::TempDir, RaftCore) {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            KvBackend::open(dir.path(), Box::new(MemKvEngine::new()), self_id, group_id).unwrap();
        let raft =
            RaftCore::new(self_id, group_id, peers, Box::new(backend), Box::new(NoopStateMachine)).unwrap();
        (dir, raft)
    }

    #[test]
    fn election_timeout_becomes_candidate_and_broadcasts_vote_requests() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let peers = vec![Uuid::new_v4(), Uuid::new_v4()];
        let (_dir, mut raft) = core(a, group, peers.clone());
        let out = raft.on_election_timeout().unwrap();
        assert_eq!(raft.role(), Role::Candidate);
        assert_eq!(raft.current_term(), 1);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn majority_yes_votes_promote_to_leader() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
        let (_dir, mut raft) = core(a, group, vec![b, c]);
        raft.on_election_timeout().unwrap();
        let term = raft.current_term();

        let out = raft
            .handle_vote_reply(b, VoteReply { term, vote_granted: true })
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(raft.role(), Role::Candidate);

        let out = raft
            .handle_vote_reply(c, VoteReply { term, vote_granted: true })
            .unwrap();
        assert_eq!(raft.role(), Role::Leader);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn higher_term_in_vote_reply_demotes_to_follower() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_dir, mut raft) = core(a, group, vec![b]);
        raft.on_election_timeout().unwrap();
        raft.handle_vote_reply(b, VoteReply { term: 99, vote_granted: false }).unwrap();
        assert_eq!(raft.role(), Role::Follower);
        assert_eq!(raft.current_term(), 99);
    }

    #[test]
    fn vote_request_with_equal_term_is_denied() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_dir, mut raft) = core(a, group, vec![b]);
        // Bump to term 1 via a self-election so `proposed_term == own_term` is denied.
        raft.on_election_timeout().unwrap();
        let rep = raft
            .handle_vote_request(
                b,
                VoteRequest {
                    proposed_term: raft.current_term(),
                    last_log_term: 0,
                    last_log_index: NO_ENTRY,
                },
            )
            .unwrap();
        assert!(!rep.vote_granted);
    }

    #[test]
    fn stale_term_append_is_rejected_without_rearming() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (_dir, mut raft) = core(a, group, vec![b]);
        raft.on_election_timeout().unwrap(); // term 1
        let rep = raft
            .handle_append_request(
                b,
                AppendRequest {
                    term: 0,
                    commit_index: NO_ENTRY,
                    prev_log_index: NO_ENTRY,
                    prev_log_term: 0,
                    entries: vec![],
                },
            )
            .unwrap();
        assert!(rep.stale_term);
        assert_eq!(raft.current_term(), 1);
    }

    #[test]
    fn mismatched_prev_term_is_nacked_without_mutating_log() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let leader = Uuid::new_v4();
        let (_dir, mut raft) = core(a, group, vec![leader]);
        let rep = raft
            .handle_append_request(
                leader,
                AppendRequest {
                    term: 1,
                    commit_index: NO_ENTRY,
                    prev_log_index: 0,
                    prev_log_term: 5,
                    entries: vec![ReplicatedEntry { index: 1, term: 1, data: vec![] }],
                },
            )
            .unwrap();
        assert!(rep.non_matching_prev_term);
        assert_eq!(raft.last_log_index, NO_ENTRY);
    }

    #[test]
    fn follower_appends_entries_and_advances_commit_index() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let leader = Uuid::new_v4();
        let (_dir, mut raft) = core(a, group, vec![leader]);
        let rep = raft
            .handle_append_request(
                leader,
                AppendRequest {
                    term: 1,
                    commit_index: 0,
                    prev_log_index: NO_ENTRY,
                    prev_log_term: 0,
                    entries: vec![ReplicatedEntry { index: 0, term: 1, data: b"x".to_vec() }],
                },
            )
            .unwrap();
        assert!(!rep.non_matching_prev_term);
        assert_eq!(rep.last_log_index, 0);
        assert_eq!(raft.commit_idx(), 0);
    }

    #[test]
    fn leader_advances_commit_index_on_majority_match() {
        let group = Uuid::new_v4();
        let a = Uuid::new_v4();
        let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
        let (_dir, mut raft) = core(a, group, vec![b, c]);
        raft.on_election_timeout().unwrap();
        let term = raft.current_term();
        raft.handle_vote_reply(b, VoteReply { term, vote_granted: true }).unwrap();
        raft.handle_vote_reply(c, VoteReply { term, vote_granted: true }).unwrap();
        assert_eq!(raft.role(), Role::Leader);

        let idx = raft.propose(b"hello".to_vec()).unwrap();
        assert_eq!(idx, 0);

        // Leader + one follower already form a majority of 3.
        raft.handle_append_reply(b, AppendReply { term, stale_term: false, non_matching_prev_term: false, last_log_index: 0 }).unwrap();
        assert_eq!(raft.commit_idx(), 0);
        raft.handle_append_reply(c, AppendReply { term, stale_term: false, non_matching_prev_term: false, last_log_index: 0 }).unwrap();
        assert_eq!(raft.commit_idx(), 0);
    }
}
