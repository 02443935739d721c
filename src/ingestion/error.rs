//! Connection error types and handling

use std::fmt;
use std::io;

/// Socket-level failures on the ingestion side
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Listening socket could not be opened
    BindFailed { address: String, details: String },
    /// Accepting a new connection failed
    AcceptFailed { kind: io::ErrorKind, details: String },
    /// Peer reset or aborted the connection
    ConnectionLost { peer: String },
    /// Any other read failure on an established connection
    ReadFailed { peer: String, kind: io::ErrorKind, details: String },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::BindFailed { address, details } => {
                write!(f, "Failed to bind {}: {}", address, details)
            }
            ConnectionError::AcceptFailed { kind, details } => {
                write!(f, "Failed to accept connection ({:?}): {}", kind, details)
            }
            ConnectionError::ConnectionLost { peer } => write!(f, "Connection to {} lost", peer),
            ConnectionError::ReadFailed { peer, kind, details } => {
                write!(f, "Read from {} failed ({:?}): {}", peer, kind, details)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

impl ConnectionError {
    /// Classify a read error on an established session
    pub fn from_read(peer: &str, error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                ConnectionError::ConnectionLost { peer: peer.to_string() }
            }
            kind => ConnectionError::ReadFailed {
                peer: peer.to_string(),
                kind,
                details: error.to_string(),
            },
        }
    }

    pub fn from_accept(error: &io::Error) -> Self {
        ConnectionError::AcceptFailed {
            kind: error.kind(),
            details: error.to_string(),
        }
    }

    /// Whether the listener can keep accepting after this error.
    ///
    /// Per-session errors never affect the listener; only a failed bind is fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConnectionError::BindFailed { .. })
    }
}
