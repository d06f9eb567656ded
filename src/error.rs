//! Unified error handling for the zaguan proxy.
//!
//! Covers network errors, configuration errors, protocol errors and the
//! operational errors raised by the cluster lifecycle (stale admissions,
//! forwarder shutdown, admission rejects).

use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol framing or parsing errors
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The process-wide connection cap was hit; written to rejected
    /// clients through their own protocol
    #[error("proxy accepted more than max connections")]
    MoreMaxConns,

    /// A connection was accepted under a configuration generation that a
    /// concurrent reload displaced before admission
    #[error("config changed during accept, admitted sn {accepted} but cluster is at sn {current}")]
    StaleGeneration { accepted: i32, current: i32 },

    /// The forwarder was closed; no new dispatch is accepted
    #[error("forwarder is shutting down")]
    ForwarderClosed,

    /// No live backend node for the hashed key
    #[error("no backend node available")]
    NoBackend,

    /// Backend connection errors
    #[error("backend error: {message}")]
    Backend { message: String },

    /// The cluster registry is full
    #[error("cluster limit reached, at most {0} clusters")]
    TooManyClusters(usize),

    /// Timeout errors
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ProxyError::Protocol(message.into())
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::Backend {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error is recoverable for the connection it occurred
    /// on (the handler keeps serving after it)
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProxyError::Backend { .. } => true,
            ProxyError::NoBackend => true,
            ProxyError::ForwarderClosed => true,
            ProxyError::Timeout { .. } => true,
            _ => false,
        }
    }
}
