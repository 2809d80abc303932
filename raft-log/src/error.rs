use thiserror::Error;

/// "Storage" and related error categories from spec §7. CRC mismatch on a
/// header load is not an error variant on its own — `header_load` folds it
/// into [`LogError::NoValidHeader`] so callers can fall back to the other
/// slot or re-initialise, matching spec §4.C.
#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Proto(#[from] raft_proto::ProtoError),

    #[error("no entry at index {0}")]
    NotFound(i64),

    #[error("no valid log header found in either slot")]
    NoValidHeader,

    #[error("operation {0} is not supported by this log backend")]
    NotSupported(&'static str),

    #[error("short write: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },

    #[error("kv engine error: {0}")]
    Engine(String),

    #[error("recovery marker error: {0}")]
    Recovery(String),

    #[error("multiple recovery markers found in log directory")]
    MultipleMarkers,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;
