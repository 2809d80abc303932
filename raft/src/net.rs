//! Raft net layer (component F, spec §4.F): envelope-level validation and
//! per-peer responsiveness bookkeeping. Pure decode/validate — the actual
//! `mio::net::UdpSocket` send/recv lives in [`crate::server`].

use std::collections::HashMap;
use std::time::Instant;

use raft_proto::envelope::{PayloadKind, RpcEnvelope};
use raft_proto::ids::{PeerId, RaftId};
use raft_proto::messages::{AppendReply, AppendRequest, VoteReply, VoteRequest};
use uuid::Uuid;

use crate::error::{RaftError, Result};

/// Exact wire size of a `VoteReq` payload (spec §4.F: server RPCs must
/// match their size exactly, no trailing client data).
const VOTE_REQUEST_SIZE: usize = 24;
const VOTE_REPLY_SIZE: usize = 9;
const APPEND_REPLY_SIZE: usize = 25;

#[derive(Debug)]
pub enum ServerRpc {
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerTimestamps {
    last_recv: Option<Instant>,
    last_unacked_send: Option<Instant>,
}

/// Validates inbound envelopes and tracks per-peer liveness, so
/// [`crate::server`] only ever hands `RaftCore` already-typed, already-
/// authenticated RPCs (spec §4.F).
pub struct RaftNet {
    self_id: PeerId,
    group_id: RaftId,
    peers: HashMap<PeerId, PeerTimestamps>,
}

impl RaftNet {
    pub fn new(self_id: PeerId, group_id: RaftId, peers: &[Uuid]) -> Self {
        let mut table = HashMap::new();
        for p in peers {
            table.insert(*p, PeerTimestamps::default());
        }
        RaftNet {
            self_id,
            group_id,
            peers: table,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn group_id(&self) -> RaftId {
        self.group_id
    }

    fn validate_server_payload_size(kind: PayloadKind, data: &[u8]) -> Result<()> {
        let ok = match kind {
            PayloadKind::VoteReq => data.len() == VOTE_REQUEST_SIZE,
            PayloadKind::VoteRep => data.len() == VOTE_REPLY_SIZE,
            PayloadKind::AppendRep => data.len() == APPEND_REPLY_SIZE,
            // AppendReq carries a variable entry list; its own decoder
            // reads an explicit entry count and rejects a short buffer,
            // so a size mismatch there surfaces as a decode error instead.
            PayloadKind::AppendReq => true,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(RaftError::Proto(raft_proto::ProtoError::ShortBuffer {
                need: 0,
                have: data.len(),
            }))
        }
    }

    /// Decodes and authenticates one inbound datagram as a server-to-server
    /// RPC. Rejects envelopes for a foreign group or from an unknown peer
    /// before even looking at the payload.
    pub fn decode_server_rpc(&mut self, buf: &[u8]) -> Result<(Uuid, ServerRpc)> {
        let env = RpcEnvelope::decode(buf)?;
        if env.group_id != self.group_id {
            return Err(RaftError::Config(format!(
                "envelope for foreign group {} (expected {})",
                env.group_id, self.group_id
            )));
        }
        let Some(ts) = self.peers.get_mut(&env.sender_id) else {
            return Err(RaftError::Config(format!("unknown peer {}", env.sender_id)));
        };
        ts.last_recv = Some(Instant::now());

        Self::validate_server_payload_size(env.payload_kind, &env.data)?;

        let rpc = match env.payload_kind {
            PayloadKind::VoteReq => ServerRpc::VoteRequest(VoteRequest::decode(&env.data)?),
            PayloadKind::VoteRep => ServerRpc::VoteReply(VoteReply::decode(&env.data)?),
            PayloadKind::AppendReq => ServerRpc::AppendRequest(AppendRequest::decode(&env.data)?),
            PayloadKind::AppendRep => ServerRpc::AppendReply(AppendReply::decode(&env.data)?),
            other => {
                return Err(RaftError::Config(format!(
                    "payload kind {:?} is not a server↔server RPC",
                    other
                )))
            }
        };
        Ok((env.sender_id, rpc))
    }

    pub fn envelope_for(&self, kind: PayloadKind, data: Vec<u8>) -> RpcEnvelope {
        RpcEnvelope::new(self.self_id, self.group_id, kind, data)
    }

    /// Call right after handing a request to the transport, so a later
    /// "stale server" check has an unacked-send timestamp to compare
    /// against (spec §4.F, consumed by the client's viability tracking —
    /// mirrored here for server↔server liveness).
    pub fn note_send(&mut self, peer: Uuid) {
        if let Some(ts) = self.peers.get_mut(&peer) {
            ts.last_unacked_send = Some(Instant::now());
        }
    }

    pub fn note_ack(&mut self, peer: Uuid) {
        if let Some(ts) = self.peers.get_mut(&peer) {
            ts.last_unacked_send = None;
        }
    }

    /// The peer with the most recent `last_recv`, used by the client for
    /// leader discovery when no redirect has arrived yet.
    pub fn most_recently_responsive_peer(&self) -> Option<Uuid> {
        self.peers
            .iter()
            .filter_map(|(id, ts)| ts.last_recv.map(|t| (*id, t)))
            .max_by_key(|(_, t)| *t)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_envelope_for_a_foreign_group() {
        let group = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut net = RaftNet::new(Uuid::new_v4(), group, &[peer]);
        let env = RpcEnvelope::new(peer, Uuid::new_v4(), PayloadKind::Ping, vec![]);
        let buf = env.encode().unwrap();
        assert!(net.decode_server_rpc(&buf).is_err());
    }

    #[test]
    fn rejects_envelope_from_an_unknown_peer() {
        let group = Uuid::new_v4();
        let mut net = RaftNet::new(Uuid::new_v4(), group, &[Uuid::new_v4()]);
        let env = RpcEnvelope::new(Uuid::new_v4(), group, PayloadKind::VoteReq, vec![0u8; VOTE_REQUEST_SIZE]);
        let buf = env.encode().unwrap();
        assert!(net.decode_server_rpc(&buf).is_err());
    }

    #[test]
    fn rejects_undersized_vote_request_payload() {
        let group = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut net = RaftNet::new(Uuid::new_v4(), group, &[peer]);
        let env = RpcEnvelope::new(peer, group, PayloadKind::VoteReq, vec![0u8; VOTE_REQUEST_SIZE - 1]);
        let buf = env.encode().unwrap();
        assert!(net.decode_server_rpc(&buf).is_err());
    }

    #[test]
    fn accepts_and_decodes_a_well_formed_vote_request() {
        let group = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut net = RaftNet::new(Uuid::new_v4(), group, &[peer]);
        let req = VoteRequest {
            proposed_term: 1,
            last_log_term: 0,
            last_log_index: -1,
        };
        let env = RpcEnvelope::new(peer, group, PayloadKind::VoteReq, req.encode().unwrap());
        let buf = env.encode().unwrap();
        let (from, rpc) = net.decode_server_rpc(&buf).unwrap();
        assert_eq!(from, peer);
        assert!(matches!(rpc, ServerRpc::VoteRequest(r) if r == req));
        assert_eq!(net.most_recently_responsive_peer(), Some(peer));
    }
}
