//! Error handling for the relay engine.
//!
//! Every session-controller operation reports failures synchronously through
//! these variants; nothing is retried internally. Retry policy belongs to the
//! control-channel collaborator.

use thiserror::Error;

use crate::types::{CallId, SessionState};

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for relay operations
#[derive(Error, Debug)]
pub enum Error {
    /// A session already exists for the given call identifier
    #[error("session already exists for call {call_id}")]
    DuplicateCallId { call_id: CallId },

    /// No session exists for the given call identifier
    #[error("no session found for call {call_id}")]
    UnknownCallId { call_id: CallId },

    /// Operation is not valid for the session's current state
    #[error("operation not valid for call {call_id} in state {state}")]
    InvalidState { call_id: CallId, state: SessionState },

    /// Not enough free ports to satisfy a reservation. Recoverable by the
    /// caller; never triggers eviction of unrelated sessions.
    #[error("port pool exhausted: requested {requested} ports, {free} free")]
    PoolExhausted { requested: usize, free: usize },

    /// Lifecycle bug surfaced by the pool: double release, release of a free
    /// port, or a port outside the configured range
    #[error("invalid port {port}: {reason}")]
    InvalidPort { port: u16, reason: String },

    /// Invalid engine configuration
    #[error("invalid relay configuration: {0}")]
    Config(String),

    /// Socket-level failure surfaced while starting a session
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create a new duplicate call id error
    pub fn duplicate_call_id(call_id: &CallId) -> Self {
        Self::DuplicateCallId {
            call_id: call_id.clone(),
        }
    }

    /// Create a new unknown call id error
    pub fn unknown_call_id(call_id: &CallId) -> Self {
        Self::UnknownCallId {
            call_id: call_id.clone(),
        }
    }

    /// Create a new invalid state error
    pub fn invalid_state(call_id: &CallId, state: SessionState) -> Self {
        Self::InvalidState {
            call_id: call_id.clone(),
            state,
        }
    }

    /// Create a new invalid port error
    pub fn invalid_port(port: u16, reason: impl Into<String>) -> Self {
        Self::InvalidPort {
            port,
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Create a new transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }
}
