use thiserror::Error;

/// Client-level error taxonomy from spec §7.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a request is already outstanding for this sub-app key")]
    Already,

    #[error("sub-app table is at capacity")]
    NoMem,

    #[error("request timed out waiting for completion")]
    TimedOut,

    #[error("request was canceled")]
    Canceled,

    #[error("reply of {reply_size} bytes exceeds the caller's buffer of {buf_size} bytes")]
    E2Big { reply_size: usize, buf_size: usize },

    #[error("no such request to cancel")]
    ENoEnt,

    #[error("reply buffer pointer does not match the original submission")]
    EStale,

    #[error(transparent)]
    Proto(#[from] raft_proto::ProtoError),

    #[error(transparent)]
    Reactor(#[from] raft_reactor::ReactorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
