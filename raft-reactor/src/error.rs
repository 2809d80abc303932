use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("handle is already installed or installing")]
    AlreadyInstalled,

    #[error("handle is not installed")]
    NotInstalled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
