//! Raft roles and the per-role bookkeeping from spec §3 (`CandidateState`,
//! `LeaderState`) and §4.E's safety/metrics supplement.

use std::collections::HashMap;

use raft_proto::ids::{EntryIndex, Term};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    Unknown,
    Yes,
    No,
}

/// Per-election bookkeeping (spec §3). Reset on every new election, sized
/// to the peer set (`original_source/src/raft.c`'s `raft_candidate_state`
/// array, here a map instead of an array since peer ids are UUIDs).
pub struct CandidateState {
    pub term: Term,
    pub votes: HashMap<Uuid, VoteResult>,
}

impl CandidateState {
    pub fn new(term: Term, peers: &[Uuid], self_id: Uuid) -> Self {
        let mut votes = HashMap::new();
        for p in peers {
            votes.insert(*p, VoteResult::Unknown);
        }
        votes.insert(self_id, VoteResult::Yes);
        CandidateState { term, votes }
    }

    pub fn yes_count(&self) -> usize {
        self.votes.values().filter(|v| **v == VoteResult::Yes).count()
    }
}

/// Per-peer leader bookkeeping (spec §3).
pub struct LeaderState {
    pub next_idx: HashMap<Uuid, EntryIndex>,
    /// Highest index known to be durably replicated on each peer, used to
    /// compute the majority-replicated index when advancing `commit_idx`.
    pub match_idx: HashMap<Uuid, EntryIndex>,
    /// Cached `prev_term_for(next_idx[peer] - 1)`; `None` is the "must be
    /// refreshed from the log" sentinel (spec §4.E open question 1,
    /// resolved: explicit reset on NACK rather than a magic `-1`).
    pub prev_term: HashMap<Uuid, Option<Term>>,
    pub commit_idx: EntryIndex,
}

impl LeaderState {
    pub fn new(peers: &[Uuid], last_log_index: EntryIndex, last_log_term: Term, commit_idx: EntryIndex) -> Self {
        let mut next_idx = HashMap::new();
        let mut match_idx = HashMap::new();
        let mut prev_term = HashMap::new();
        for p in peers {
            next_idx.insert(*p, last_log_index + 1);
            match_idx.insert(*p, raft_proto::ids::NO_ENTRY);
            prev_term.insert(*p, Some(last_log_term));
        }
        LeaderState {
            next_idx,
            match_idx,
            prev_term,
            commit_idx,
        }
    }
}

/// Read-only counters exposed alongside the protocol state (spec §4.E
/// supplement from `original_source/src/raft.c`'s `rp_accepted_votes`/
/// `rp_rejected_votes`), not wired to any specific metrics backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub votes_accepted: u64,
    pub votes_rejected: u64,
    pub append_entries_sent: u64,
    pub append_entries_received: u64,
    pub entries_applied: u64,
}
