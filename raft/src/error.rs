use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Log(#[from] raft_log::LogError),

    #[error(transparent)]
    Proto(#[from] raft_proto::ProtoError),

    #[error(transparent)]
    Reactor(#[from] raft_reactor::ReactorError),

    #[error("not the leader; believed leader is {0:?}")]
    NotLeader(Option<uuid::Uuid>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
