//! `raft-server`: the CLI entrypoint for one Raft group member (spec §6
//! "Process model and CLI"). Parses flags with `clap`'s derive API (the
//! same idiom the corpus uses for its own binaries), loads the cluster
//! config, opens the log, and drives [`raft::Server`] until the process
//! is killed.
//!
//! Exit codes are the bitwise OR of every stage that failed to initialize
//! (spec §6): config=1, socket bind=2, log open=4, log load=8,
//! timer create=16, poll setup=32. A clean run never returns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mio::net::UdpSocket;
use uuid::Uuid;

use raft::{ClusterConfig, FileClusterConfig, NoopStateMachine, RaftCore, Server};
use raft_log::{KvBackend, SledKvEngine};

#[derive(Parser, Debug)]
#[command(name = "raft-server", about = "Runs one member of a raft group")]
struct Args {
    /// UUID of the raft group this node belongs to.
    #[arg(short = 'r', long = "raft-uuid")]
    raft_uuid: Uuid,

    /// This node's own peer UUID (must appear in the config's peer table).
    #[arg(short = 'u', long = "peer-uuid")]
    peer_uuid: Uuid,

    /// Path to the cluster's TOML config file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Directory the replicated log and its sled database live under.
    #[arg(short = 'l', long = "log-dir", default_value = "./raft-log")]
    log_dir: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_SOCKET: u8 = 2;
const EXIT_LOG_OPEN: u8 = 4;
const EXIT_LOG_LOAD: u8 = 8;
#[allow(dead_code)]
const EXIT_TIMER: u8 = 16;
const EXIT_POLL: u8 = 32;

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn run(args: Args) -> Result<(), u8> {
    let config = FileClusterConfig::load(&args.config, args.raft_uuid, args.peer_uuid)
        .map_err(|e| {
            log::error!("failed to load config {:?}: {}", args.config, e);
            EXIT_CONFIG
        })?;

    let self_addr: SocketAddr = config
        .peer_addr(args.peer_uuid)
        .ok_or(EXIT_CONFIG)
        .map_err(|c| {
            log::error!("self uuid {} missing a peer_addr entry", args.peer_uuid);
            c
        })?;
    let self_client_addr: SocketAddr = config.client_addr_of(args.peer_uuid).ok_or(EXIT_CONFIG)?;

    let peer_socket = UdpSocket::bind(self_addr).map_err(|e| {
        log::error!("failed to bind peer socket {}: {}", self_addr, e);
        EXIT_SOCKET
    })?;
    let client_socket = UdpSocket::bind(self_client_addr).map_err(|e| {
        log::error!("failed to bind client socket {}: {}", self_client_addr, e);
        EXIT_SOCKET
    })?;

    let engine = SledKvEngine::open(&args.log_dir.join("db")).map_err(|e| {
        log::error!("failed to open sled engine at {:?}: {}", args.log_dir, e);
        EXIT_LOG_OPEN
    })?;
    let backend = KvBackend::open(&args.log_dir, Box::new(engine), args.peer_uuid, args.raft_uuid)
        .map_err(|e| {
            log::error!("failed to open log backend at {:?}: {}", args.log_dir, e);
            EXIT_LOG_OPEN
        })?;

    let peers: Vec<Uuid> = config.other_peers();
    let core = RaftCore::new(
        args.peer_uuid,
        args.raft_uuid,
        peers,
        Box::new(backend),
        Box::new(NoopStateMachine),
    )
    .map_err(|e| {
        log::error!("failed to recover raft state: {}", e);
        EXIT_LOG_LOAD
    })?;

    let mut server = Server::setup(&config, core, peer_socket, client_socket).map_err(|e| {
        log::error!("failed to set up poll loop: {}", e);
        EXIT_POLL
    })?;

    log::info!("raft-server {} started (group {})", args.peer_uuid, args.raft_uuid);
    server.run().map_err(|e| {
        log::error!("server loop exited: {}", e);
        EXIT_POLL
    })
}
