//! `ClusterConfig` (spec §1 external collaborator) plus the tunables from
//! spec §6, read from a stand-in TOML file (`serde` + `toml`, matching the
//! corpus's `serde`/JSON-or-YAML config idiom — `examples/cbaugus-rust_loadtest`,
//! `examples/dragfire-leetup`). Production deployments are expected to
//! swap `FileClusterConfig` for their real config service; only the
//! `ClusterConfig` trait is load-bearing.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{RaftError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub client_addr: SocketAddr,
}

/// Runtime options from spec §6, plus the election/heartbeat timing
/// constants named in §4.E (not listed among §6's "recognized runtime
/// options" but given explicit defaults there, so kept alongside the rest
/// of the tunables instead of hardcoded).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub epoll_max_events: usize,
    pub client_timer_ms: u64,
    pub stale_server_ms: u64,
    pub retry_timeout_ms: u64,
    pub requests_per_sec: u32,
    pub pings_to_viable: u32,
    pub max_subapps: usize,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            epoll_max_events: 128,
            client_timer_ms: 10,
            stale_server_ms: 100,
            retry_timeout_ms: 20,
            requests_per_sec: 1000,
            pings_to_viable: 4,
            max_subapps: 4096,
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_ms: 50,
        }
    }
}

impl Tunables {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }
}

pub trait ClusterConfig: Send {
    fn raft_uuid(&self) -> Uuid;
    fn self_uuid(&self) -> Uuid;
    fn peers(&self) -> &[PeerEntry];
    fn tunables(&self) -> &Tunables;

    fn peer_addr(&self, peer: Uuid) -> Option<SocketAddr> {
        self.peers().iter().find(|p| p.id == peer).map(|p| p.addr)
    }

    fn client_addr_of(&self, peer: Uuid) -> Option<SocketAddr> {
        self.peers().iter().find(|p| p.id == peer).map(|p| p.client_addr)
    }

    /// Every configured peer other than this node.
    fn other_peers(&self) -> Vec<Uuid> {
        self.peers()
            .iter()
            .map(|p| p.id)
            .filter(|id| *id != self.self_uuid())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileClusterConfig {
    #[serde(skip)]
    raft_uuid: Uuid,
    #[serde(skip)]
    self_uuid: Uuid,
    #[serde(rename = "peer", default)]
    peers: Vec<PeerEntry>,
    #[serde(default)]
    tunables: Tunables,
}

impl FileClusterConfig {
    pub fn load(path: impl AsRef<Path>, raft_uuid: Uuid, self_uuid: Uuid) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(RaftError::Io)?;
        let mut parsed: FileClusterConfig =
            toml::from_str(&text).map_err(|e| RaftError::Config(e.to_string()))?;
        parsed.raft_uuid = raft_uuid;
        parsed.self_uuid = self_uuid;
        if !parsed.peers.iter().any(|p| p.id == self_uuid) {
            return Err(RaftError::Config(format!(
                "self uuid {self_uuid} not present among configured peers"
            )));
        }
        Ok(parsed)
    }
}

impl ClusterConfig for FileClusterConfig {
    fn raft_uuid(&self) -> Uuid {
        self.raft_uuid
    }

    fn self_uuid(&self) -> Uuid {
        self.self_uuid
    }

    fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_peers_and_falls_back_to_tunable_defaults() {
        let self_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let toml_text = format!(
            r#"
            [[peer]]
            id = "{self_id}"
            addr = "127.0.0.1:9000"
            client_addr = "127.0.0.1:9001"

            [[peer]]
            id = "{other}"
            addr = "127.0.0.1:9100"
            client_addr = "127.0.0.1:9101"
            "#
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_text.as_bytes()).unwrap();
        let cfg = FileClusterConfig::load(file.path(), Uuid::new_v4(), self_id).unwrap();
        assert_eq!(cfg.peers().len(), 2);
        assert_eq!(cfg.other_peers(), vec![other]);
        assert_eq!(cfg.tunables().heartbeat_ms, 50);
    }

    #[test]
    fn rejects_config_missing_self() {
        let toml_text = r#"
            [[peer]]
            id = "00000000-0000-0000-0000-000000000001"
            addr = "127.0.0.1:9000"
            client_addr = "127.0.0.1:9001"
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_text.as_bytes()).unwrap();
        match FileClusterConfig::load(file.path(), Uuid::new_v4(), Uuid::new_v4()) {
            Err(RaftError::Config(_)) => {}
            other => panic!("expected Config error, got {:?}", other),
        }
    }
}
