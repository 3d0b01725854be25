//! Error types for burrow

use std::fmt;
use std::io;

use thiserror::Error;

/// The phase of a tunnelled connection an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dial,
    Handshake,
    Connect,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Dial => write!(f, "dial"),
            Phase::Handshake => write!(f, "handshake"),
            Phase::Connect => write!(f, "connect"),
        }
    }
}

/// Main error type for burrow
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{phase} failed: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{0} timed out")]
    Timeout(Phase),

    #[error("{phase} rejected by peer: {reason}")]
    Rejected { phase: Phase, reason: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Listener already registered: {0}")]
    DuplicateListener(String),

    #[error("Listener not registered: {0}")]
    UnknownListener(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a low-level I/O error with the phase it happened in
    pub fn transport(phase: Phase, source: io::Error) -> Self {
        Error::Transport { phase, source }
    }

    pub fn rejected(phase: Phase, reason: impl Into<String>) -> Self {
        Error::Rejected {
            phase,
            reason: reason.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Check if this error is a timeout of any phase
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(e) | Error::Transport { source: e, .. } => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check if the peer explicitly refused the request
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Transport { source, .. } => source,
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            Error::SessionClosed => io::Error::new(io::ErrorKind::NotConnected, err.to_string()),
            Error::Rejected { .. } => {
                io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string())
            }
            Error::InvalidAddress(_) | Error::Malformed(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err.to_string())
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias for burrow
pub type Result<T> = std::result::Result<T, Error>;
