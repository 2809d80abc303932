//! Client runtime (component G) wiring: sub-app table, retry scheduler,
//! leader viability, and the UDP datagram path that actually sends/routes
//! envelopes. One instance owns one `mio::net::UdpSocket`; in production
//! this is driven by a `raft_reactor::PollSet` event loop thread (one per
//! client instance, spec §5), with application threads calling
//! `submit_blocking`/`submit_async`/`cancel` from any thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use uuid::Uuid;

use raft_proto::envelope::{PayloadKind, RpcEnvelope};

use crate::error::{ClientError, Result};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryScheduler;
use crate::subapp::{Completion, SubAppKey};
use crate::table::SubAppTable;
use crate::viability::{PingOutcome, Viability};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_timer_ms: u64,
    pub stale_server_ms: u64,
    pub retry_timeout_ms: u64,
    pub requests_per_sec: u32,
    pub rate_limit_burst: u32,
    pub pings_to_viable: u32,
    pub max_subapps: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_timer_ms: 10,
            stale_server_ms: 100,
            retry_timeout_ms: 20,
            requests_per_sec: 1000,
            rate_limit_burst: 8,
            pings_to_viable: 4,
            max_subapps: 4096,
        }
    }
}

pub struct RaftClient {
    self_id: Uuid,
    group_id: Uuid,
    socket: UdpSocket,
    peer_addrs: HashMap<Uuid, SocketAddr>,
    table: SubAppTable,
    viability: Mutex<Viability>,
    retry: Mutex<RetryScheduler>,
    rate_limiter: Mutex<RateLimiter>,
    msg_id_prefix: u32,
    msg_id_counter: AtomicU32,
    config: ClientConfig,
}

impl RaftClient {
    pub fn new(
        self_id: Uuid,
        group_id: Uuid,
        socket: UdpSocket,
        peer_addrs: HashMap<Uuid, SocketAddr>,
        config: ClientConfig,
    ) -> Self {
        // Invariant 9: msg_id upper 32 bits are a process-seeded prefix
        // derived from the client's own uuid.
        let msg_id_prefix = self_id.as_u128() as u32;
        let retry = RetryScheduler::new(Duration::from_millis(config.client_timer_ms), config.retry_timeout_ms);
        let rate_limiter = RateLimiter::new(config.requests_per_sec, config.rate_limit_burst);
        RaftClient {
            self_id,
            group_id,
            socket,
            peer_addrs,
            table: SubAppTable::new(config.max_subapps),
            viability: Mutex::new(Viability::new(config.pings_to_viable, config.stale_server_ms)),
            retry: Mutex::new(retry),
            rate_limiter: Mutex::new(rate_limiter),
            msg_id_prefix,
            msg_id_counter: AtomicU32::new(0),
            config,
        }
    }

    fn next_msg_id(&self) -> u64 {
        let lo = self.msg_id_counter.fetch_add(1, Ordering::Relaxed);
        ((self.msg_id_prefix as u64) << 32) | lo as u64
    }

    fn believed_leader_addr(&self) -> Option<SocketAddr> {
        let leader = self.viability.lock().unwrap().believed_leader()?;
        self.peer_addrs.get(&leader).copied()
    }

    fn send_envelope(&self, env: &RpcEnvelope, dest: SocketAddr) -> Result<()> {
        let encoded = env.encode()?;
        self.socket.send_to(&encoded, dest)?;
        Ok(())
    }

    /// Drains up to the rate limiter's current budget from the send queue
    /// (spec §4.G "Rate limiter": a per-second token budget plus an
    /// `rate_limit_burst`-item micro-batch cap per call), transmitting
    /// each ready sub-app's request to the believed leader — or dropping
    /// it silently if there is none yet (the retry scheduler will
    /// re-enqueue it once a leader is known). Anything left past the
    /// budget stays on the queue for the next call to drain.
    pub fn send_pending(&self) -> Result<usize> {
        let budget = self.rate_limiter.lock().unwrap().budget(Instant::now());
        let mut sent = 0;
        let mut examined = 0;
        while examined < budget {
            let Some(app) = self.table.dequeue_ready_to_send() else { break };
            examined += 1;
            let Some(dest) = self.believed_leader_addr() else {
                continue;
            };
            let (rpc, msg_id) = {
                let s = app.state.lock().unwrap();
                (s.rpc.clone(), s.msg_id)
            };
            let mut env = RpcEnvelope::new(self.self_id, self.group_id, PayloadKind::ClientReq, rpc);
            env.dest_id = Some(self.self_id);
            env.msg_id = Some(msg_id);
            if self.send_envelope(&env, dest).is_ok() {
                sent += 1;
            }
        }
        if examined > 0 {
            self.rate_limiter.lock().unwrap().consume(examined);
        }
        Ok(sent)
    }

    fn submit_inner(&self, key: SubAppKey, rpc: Vec<u8>, reply_cap: usize, completion: Completion) -> Result<std::sync::Arc<crate::subapp::SubApp>> {
        let msg_id = self.next_msg_id();
        let app = self.table.submit(key, rpc, reply_cap, msg_id, completion)?;
        self.table.submit_enqueue(&app);
        self.send_pending()?;
        Ok(app)
    }

    /// Blocking submit (spec §4.G / §5): parks the calling thread on the
    /// sub-app's condvar until completion, cancellation, or `timeout`.
    pub fn submit_blocking(
        &self,
        key: SubAppKey,
        rpc: Vec<u8>,
        reply_cap: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let app = self.submit_inner(key, rpc, reply_cap, Completion::Blocking)?;
        let deadline = timeout.map(|d| Instant::now() + d);
        let result = app.wait_for_completion(deadline);
        self.table.prune_quiescent();
        result.map_err(Into::into)
    }

    /// Async submit: returns immediately; `callback` runs exactly once,
    /// off the instance lock, with the final result.
    pub fn submit_async(
        &self,
        key: SubAppKey,
        rpc: Vec<u8>,
        reply_cap: usize,
        callback: Box<dyn FnOnce(std::result::Result<Vec<u8>, ClientError>) + Send>,
    ) -> Result<()> {
        self.submit_inner(key, rpc, reply_cap, Completion::Async(callback))?;
        Ok(())
    }

    pub fn cancel(&self, key: &SubAppKey, reply_cap: usize) -> Result<()> {
        self.table.cancel(key, reply_cap)?;
        self.table.prune_quiescent();
        Ok(())
    }

    /// Sends a ping to the believed leader, or to the most-recently
    /// responsive peer if the believed leader is stale or unknown (spec
    /// §4.G "Leader viability").
    pub fn send_ping(&self) -> Result<()> {
        let now = Instant::now();
        let (target, is_redirect_probe) = {
            let v = self.viability.lock().unwrap();
            if v.is_viable() && !v.is_stale(now) {
                return Ok(());
            }
            match v.believed_leader() {
                Some(leader) if !v.is_stale(now) => (Some(leader), false),
                _ => (v.most_responsive_peer(), true),
            }
        };
        let Some(target) = target.and_then(|p| self.peer_addrs.get(&p).copied().map(|a| (p, a))) else {
            return Ok(());
        };
        let _ = is_redirect_probe;
        let env = RpcEnvelope::new(self.self_id, self.group_id, PayloadKind::Ping, vec![]);
        self.send_envelope(&env, target.1)?;
        self.viability.lock().unwrap().record_ping_sent(now);
        Ok(())
    }

    /// Handles one inbound datagram (the poll-thread callback body):
    /// pings, redirects, and completions all come back on the same
    /// socket and are routed here.
    pub fn on_datagram(&self, buf: &[u8], from: SocketAddr) -> Result<()> {
        let env = RpcEnvelope::decode(buf)?;
        if env.group_id != self.group_id {
            log::warn!("dropping envelope for foreign group {}", env.group_id);
            return Ok(());
        }
        let now = Instant::now();
        match env.payload_kind {
            PayloadKind::PingRep => {
                let outcome = classify_sys_error(env.sys_error);
                self.viability.lock().unwrap().on_ping_outcome(env.sender_id, outcome, now);
            }
            PayloadKind::Redirect => {
                let redirect = raft_proto::messages::Redirect::decode(&env.data)?;
                self.viability.lock().unwrap().adopt_leader(redirect.leader, true);
            }
            PayloadKind::ClientRep => {
                self.viability.lock().unwrap().record_responsive(env.sender_id, now);
                // sys_error != 0 (e.g. "not leader", "busy") is left for the
                // retry scheduler to re-drive: the sub-app stays idle in
                // the table and gets re-enqueued once `retry_timeout_ms`
                // elapses, by which time a redirect or ping will usually
                // have updated the believed leader.
                if env.sys_error == 0 {
                    if let Some(msg_id) = env.msg_id {
                        if let Some(app) = self.table.find_by_msg_id(msg_id) {
                            app.complete(env.data);
                        }
                    }
                }
            }
            other => {
                log::debug!("client ignoring unexpected payload kind {:?} from {from}", other);
            }
        }
        Ok(())
    }

    /// Drives the retry scheduler; call this from the client's periodic
    /// timer handle.
    pub fn tick(&self, now: Instant) -> Result<()> {
        if self.retry.lock().unwrap().tick(now, &self.table).is_some() {
            self.send_pending()?;
        }
        if !self.viability.lock().unwrap().is_viable() {
            self.send_ping()?;
        }
        self.table.prune_quiescent();
        Ok(())
    }

    pub fn table(&self) -> &SubAppTable {
        &self.table
    }
}

// Minimal POSIX errno stand-ins so `on_datagram` can classify `sys_error`
// without depending on `libc` for five constants.
const EAGAIN: i32 = 11;
const EBUSY: i32 = 16;
const EINPROGRESS: i32 = 115;
const ENOENT: i32 = 2;
const ENOSYS: i32 = 38;

fn classify_sys_error(sys_error: i32) -> PingOutcome {
    if sys_error == 0 {
        PingOutcome::Ok
    } else if sys_error == EAGAIN || sys_error == EBUSY || sys_error == EINPROGRESS {
        PingOutcome::Busy
    } else if sys_error == ENOENT || sys_error == ENOSYS {
        PingOutcome::Gone
    } else {
        PingOutcome::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_pair() -> (UdpSocket, UdpSocket, SocketAddr, SocketAddr) {
        let a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, a_addr, b_addr)
    }

    #[test]
    fn submit_enqueues_but_drops_silently_with_no_known_leader() {
        let (sock, _peer_sock, _a, peer_addr) = loopback_pair();
        let group = Uuid::new_v4();
        let self_id = Uuid::new_v4();
        let mut peers = HashMap::new();
        peers.insert(Uuid::new_v4(), peer_addr);
        let client = RaftClient::new(self_id, group, sock, peers, ClientConfig::default());
        let key = SubAppKey::new(Uuid::new_v4(), [0, 0, 0, 0]);
        let sent = client.submit_inner(key, vec![1, 2, 3], 64, Completion::Blocking).unwrap();
        // No believed leader yet, so it should still be sitting in the table.
        assert!(client.table().get(&key).is_some());
        drop(sent);
    }

    #[test]
    fn completion_routes_to_the_waiting_subapp() {
        let (sock, peer_sock, _a, peer_addr) = loopback_pair();
        let group = Uuid::new_v4();
        let self_id = Uuid::new_v4();
        let leader = Uuid::new_v4();
        let mut peers = HashMap::new();
        peers.insert(leader, peer_addr);
        let client = RaftClient::new(self_id, group, sock, peers, ClientConfig::default());
        client.viability.lock().unwrap().adopt_leader(leader, true);

        let key = SubAppKey::new(Uuid::new_v4(), [0, 0, 0, 0]);
        let msg_id = client.next_msg_id();
        let app = client
            .table()
            .submit(key, vec![9], 64, msg_id, Completion::Blocking)
            .unwrap();
        client.table().submit_enqueue(&app);
        client.send_pending().unwrap();

        // Simulate the "leader"'s reply arriving.
        let mut buf = [0u8; 2048];
        let (n, _from) = peer_sock.recv_from(&mut buf).unwrap();
        let req = RpcEnvelope::decode(&buf[..n]).unwrap();
        assert_eq!(req.msg_id, Some(msg_id));

        let mut reply = RpcEnvelope::new(leader, group, PayloadKind::ClientRep, b"ok".to_vec());
        reply.msg_id = Some(msg_id);
        let encoded = reply.encode().unwrap();
        client.on_datagram(&encoded, peer_addr).unwrap();

        assert!(app.is_ready());
    }
}
