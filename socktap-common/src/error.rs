use thiserror::Error;

/// Common error types used across socktap components
#[derive(Error, Debug)]
pub enum SocktapError {
    #[error("system call error: {0}")]
    SystemCallError(#[from] nix::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("seccomp notification error: {0}")]
    SeccompError(#[from] libseccomp::error::SeccompError),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("process error: {0}")]
    ProcessError(String),
}

pub type Result<T> = std::result::Result<T, SocktapError>;
