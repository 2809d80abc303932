//! Wires the poll loop (spec §2/§5: "one raft thread runs the poll loop
//! over {timer, peer socket, client socket, event pipe}") together with
//! the log backend, the net layer, and the core state machine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::Interest;
use uuid::Uuid;

use raft_proto::envelope::{PayloadKind, RpcEnvelope};
use raft_proto::ids::EntryIndex;
use raft_proto::messages::Redirect;
use raft_reactor::{Handle, PollSet};

use crate::config::ClusterConfig;
use crate::core::{Outbound, RaftCore};
use crate::error::Result;
use crate::net::{RaftNet, ServerRpc};
use crate::state::Role;
use crate::timers::{ElectionTimer, HeartbeatTimer};

/// A client write request accepted by `propose()` but not yet committed;
/// replied to once `commit_idx` reaches `index`.
struct PendingClientReply {
    index: EntryIndex,
    dest: SocketAddr,
    sender_id: Uuid,
    msg_id: Option<u64>,
}

pub struct Server {
    core: RaftCore,
    net: RaftNet,
    peer_socket: UdpSocket,
    client_socket: UdpSocket,
    peer_addrs: HashMap<Uuid, SocketAddr>,
    election_timer: ElectionTimer,
    heartbeat_timer: HeartbeatTimer,
    pending_client_replies: Vec<PendingClientReply>,
    poll: PollSet,
    peer_ready: Arc<AtomicBool>,
    client_ready: Arc<AtomicBool>,
}

impl Server {
    pub fn setup(
        config: &dyn ClusterConfig,
        core: RaftCore,
        peer_socket: UdpSocket,
        client_socket: UdpSocket,
    ) -> Result<Self> {
        let tunables = config.tunables();
        let peers: Vec<Uuid> = config.other_peers();
        let net = RaftNet::new(config.self_uuid(), config.raft_uuid(), &peers);

        let mut peer_addrs = HashMap::new();
        for p in &peers {
            if let Some(addr) = config.peer_addr(*p) {
                peer_addrs.insert(*p, addr);
            }
        }

        let (emin, emax) = tunables.election_timeout_range();
        let election_timer = ElectionTimer::new(emin, emax);
        let heartbeat_timer = HeartbeatTimer::new(tunables.heartbeat_interval());

        let poll = PollSet::setup()?;
        let peer_ready = Arc::new(AtomicBool::new(false));
        let client_ready = Arc::new(AtomicBool::new(false));

        let peer_flag = peer_ready.clone();
        poll.add(Handle::new(peer_socket.as_raw_fd(), Interest::READABLE, move || {
            peer_flag.store(true, Ordering::SeqCst);
        }))?;
        let client_flag = client_ready.clone();
        poll.add(Handle::new(client_socket.as_raw_fd(), Interest::READABLE, move || {
            client_flag.store(true, Ordering::SeqCst);
        }))?;

        Ok(Server {
            core,
            net,
            peer_socket,
            client_socket,
            peer_addrs,
            election_timer,
            heartbeat_timer,
            pending_client_replies: Vec::new(),
            poll,
            peer_ready,
            client_ready,
        })
    }

    fn send_outbound(&mut self, out: Outbound) {
        let (peer, kind, payload) = match out {
            Outbound::VoteRequest(peer, req) => (peer, PayloadKind::VoteReq, req.encode()),
            Outbound::VoteReply(peer, rep) => (peer, PayloadKind::VoteRep, rep.encode()),
            Outbound::AppendRequest(peer, req) => (peer, PayloadKind::AppendReq, req.encode()),
            Outbound::AppendReply(peer, rep) => (peer, PayloadKind::AppendRep, rep.encode()),
        };
        let Ok(payload) = payload else {
            log::warn!("dropping outbound RPC to {peer}: encode failed");
            return;
        };
        let Some(addr) = self.peer_addrs.get(&peer).copied() else {
            log::warn!("dropping outbound RPC to unconfigured peer {peer}");
            return;
        };
        let env = self.net.envelope_for(kind, payload);
        let Ok(buf) = env.encode() else { return };
        if self.peer_socket.send_to(&buf, addr).is_ok() {
            self.net.note_send(peer);
        }
    }

    fn send_all(&mut self, outs: Vec<Outbound>) {
        for out in outs {
            self.send_outbound(out);
        }
    }

    fn drain_peer_socket(&mut self) {
        let mut buf = [0u8; raft_proto::envelope::MAX_ENVELOPE_DATA + 256];
        loop {
            match self.peer_socket.recv_from(&mut buf) {
                Ok((n, _from_addr)) => {
                    if let Err(e) = self.handle_peer_datagram(&buf[..n]) {
                        log::warn!("peer datagram rejected: {:?}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("peer socket recv error: {}", e);
                    break;
                }
            }
        }
    }

    /// Rearms the election timer on every valid leader append and every
    /// vote grant (spec §4.E "Timers"; self-vote is rearmed separately in
    /// `tick`'s own election-timeout branch).
    fn handle_peer_datagram(&mut self, buf: &[u8]) -> Result<()> {
        let (from, rpc) = self.net.decode_server_rpc(buf)?;
        let outs = match rpc {
            ServerRpc::VoteRequest(req) => {
                let rep = self.core.handle_vote_request(from, req)?;
                if rep.vote_granted {
                    self.election_timer.rearm();
                }
                vec![Outbound::VoteReply(from, rep)]
            }
            ServerRpc::VoteReply(rep) => {
                self.net.note_ack(from);
                self.core.handle_vote_reply(from, rep)?
            }
            ServerRpc::AppendRequest(req) => {
                let rep = self.core.handle_append_request(from, req)?;
                if !rep.stale_term {
                    self.election_timer.rearm();
                }
                vec![Outbound::AppendReply(from, rep)]
            }
            ServerRpc::AppendReply(rep) => {
                self.net.note_ack(from);
                self.core.handle_append_reply(from, rep)?
            }
        };
        self.send_all(outs);
        self.drain_committed_client_replies();
        Ok(())
    }

    fn drain_client_socket(&mut self) {
        let mut buf = [0u8; raft_proto::envelope::MAX_ENVELOPE_DATA + 256];
        loop {
            match self.client_socket.recv_from(&mut buf) {
                Ok((n, from_addr)) => self.handle_client_datagram(&buf[..n], from_addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("client socket recv error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_client_datagram(&mut self, buf: &[u8], from_addr: SocketAddr) {
        let Ok(env) = RpcEnvelope::decode(buf) else { return };
        if env.group_id != self.net.group_id() {
            return;
        }
        match env.payload_kind {
            PayloadKind::Ping => {
                let reply = RpcEnvelope::new(self.net.self_id(), self.net.group_id(), PayloadKind::PingRep, vec![]);
                if let Ok(out) = reply.encode() {
                    let _ = self.client_socket.send_to(&out, from_addr);
                }
            }
            PayloadKind::ClientReq => {
                if self.core.role() != Role::Leader {
                    // No known leader yet: stay silent and let the
                    // client's retry scheduler resend (spec §4.G).
                    let Some(leader) = self.core.believed_leader() else { return };
                    let Ok(body) = Redirect { leader }.encode() else { return };
                    let mut reply =
                        RpcEnvelope::new(self.net.self_id(), self.net.group_id(), PayloadKind::Redirect, body);
                    reply.msg_id = env.msg_id;
                    if let Ok(out) = reply.encode() {
                        let _ = self.client_socket.send_to(&out, from_addr);
                    }
                    return;
                }
                match self.core.propose(env.data) {
                    Ok(index) => self.pending_client_replies.push(PendingClientReply {
                        index,
                        dest: from_addr,
                        sender_id: env.sender_id,
                        msg_id: env.msg_id,
                    }),
                    Err(e) => log::warn!("rejecting client request: {:?}", e),
                }
            }
            _ => {}
        }
    }

    fn drain_committed_client_replies(&mut self) {
        let commit_idx = self.core.commit_idx();
        let (ready, still_pending): (Vec<_>, Vec<_>) = self
            .pending_client_replies
            .drain(..)
            .partition(|p| p.index <= commit_idx);
        self.pending_client_replies = still_pending;
        for p in ready {
            let mut reply = RpcEnvelope::new(self.net.self_id(), self.net.group_id(), PayloadKind::ClientRep, vec![]);
            reply.dest_id = Some(p.sender_id);
            reply.msg_id = p.msg_id;
            if let Ok(out) = reply.encode() {
                let _ = self.client_socket.send_to(&out, p.dest);
            }
        }
    }

    /// Caps the poll wait by whichever timer (election or, while leader,
    /// heartbeat) is due soonest, so `tick` never sleeps past a deadline.
    fn next_timeout(&self, now: Instant) -> Duration {
        let min_wait = Duration::from_millis(1);
        let election_wait = self.election_timer.deadline().saturating_duration_since(now).max(min_wait);
        if self.core.role() != Role::Leader {
            return election_wait;
        }
        if self.heartbeat_timer.is_expired(now) {
            return min_wait;
        }
        election_wait
    }

    /// Runs one iteration of the poll loop: wait, then dispatch whatever
    /// readiness/timeouts fired. Returns after at most one `wait_and_dispatch`.
    pub fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let timeout = self.next_timeout(now);
        self.poll.wait_and_dispatch(Some(timeout))?;

        if self.peer_ready.swap(false, Ordering::SeqCst) {
            self.drain_peer_socket();
        }
        if self.client_ready.swap(false, Ordering::SeqCst) {
            self.drain_client_socket();
        }

        let now = Instant::now();
        if self.core.role() != Role::Leader && self.election_timer.is_expired(now) {
            let outs = self.core.on_election_timeout()?;
            self.election_timer.rearm();
            self.send_all(outs);
        }
        if self.core.role() == Role::Leader && self.heartbeat_timer.is_expired(now) {
            let outs = self.core.heartbeat_tick();
            self.heartbeat_timer.rearm();
            self.send_all(outs);
        }
        Ok(())
    }

    /// Drives the loop forever. The `raft-server` binary's main calls this.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick()?;
        }
    }
}
