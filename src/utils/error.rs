//! The `error` module defines the error type shared by the broker and the
//! client transport.
//!
//! Every fallible operation in `popbus` returns [`Result`]. The variants follow
//! how the caller is expected to react: `ConnectionLost` is retried through a
//! reconnect cycle, `Decode` drops a single frame, `Protocol` drops the whole
//! connection, and the rest are surfaced unchanged.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("another instance is already running (lock held on {})", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    /// Returns true when the failed operation may succeed after reconnecting.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::UnexpectedEof => Error::ConnectionLost(err),
            _ => Error::Io(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
