pub mod config;
pub mod core;
pub mod error;
pub mod net;
pub mod server;
pub mod state;
pub mod timers;

pub use config::{ClusterConfig, FileClusterConfig, PeerEntry, Tunables};
pub use core::{NoopStateMachine, Outbound, RaftCore, StateMachine};
pub use error::{RaftError, Result};
pub use net::{RaftNet, ServerRpc};
pub use server::Server;
pub use state::{CandidateState, LeaderState, Metrics, Role, VoteResult};
pub use timers::{ElectionTimer, HeartbeatTimer};
