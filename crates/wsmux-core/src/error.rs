use thiserror::Error;

/// Errors produced by the wsmux wire and session layers.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type MuxResult<T> = Result<T, MuxError>;
