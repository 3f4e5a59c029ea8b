//! Error types for catchup-core

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using catchup-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// A retrieval or history request failed; nothing was cached
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The workspace accessor could not complete an operation
    #[error("workspace error at {}: {message}", path.display())]
    Workspace { path: PathBuf, message: String },

    /// A node id that does not belong to the tree
    #[error("unknown diff node {0}")]
    UnknownNode(usize),

    /// The monitor asked the operation to stop
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap any displayable failure as a workspace error for `path`
    pub fn workspace(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Workspace {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection could not be established or dropped
    Network,
    /// The server answered something the client could not interpret
    Protocol,
    /// Credentials rejected
    Auth,
    /// The requested path, revision or tag does not exist
    NotFound,
    /// The transport gave up waiting
    Timeout,
}

/// Failure reported by a [`Transport`](crate::transport::Transport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport failure ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => TransportErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            std::io::ErrorKind::PermissionDenied => TransportErrorKind::Auth,
            _ => TransportErrorKind::Network,
        };
        Self::new(kind, err.to_string())
    }
}
