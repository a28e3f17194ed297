//! Domain-specific error types for deskstream.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Worker threads never panic on bad input or lost devices; every
//! failure is a typed value that the session orchestrator can act on.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Lifecycle ────────────────────────────────────────────────
    /// A required collaborator failed to start. Fatal to the mode
    /// being initialised.
    #[error("failed to initialise {component}: {reason}")]
    InitializationFailure {
        component: &'static str,
        reason: String,
    },

    /// An external device or handle was invalidated mid-session.
    #[error("resource lost: {0}")]
    ResourceLost(String),

    /// An operation was requested in a session state that forbids it.
    #[error("cannot {action} while {state}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The feature is not available on this build or platform.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    // ── Transient ────────────────────────────────────────────────
    /// Nothing arrived before the deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The socket could not accept the datagram right now.
    #[error("operation would block")]
    WouldBlock,

    /// A bounded queue rejected a push because it was full.
    #[error("queue saturated")]
    QueueSaturation,

    // ── Wire ─────────────────────────────────────────────────────
    /// A datagram failed framing or header validation.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A serialized frame does not fit in one datagram.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    // ── Collaborators ────────────────────────────────────────────
    /// Compression or decompression failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The signaling channel failed or sent something unexpected.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The socket layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Shorthand for [`StreamError::InitializationFailure`].
    pub fn init(component: &'static str, reason: impl ToString) -> Self {
        StreamError::InitializationFailure {
            component,
            reason: reason.to_string(),
        }
    }

    /// `true` for conditions that are retried on the next loop
    /// iteration instead of being reported.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Timeout(_) | StreamError::WouldBlock | StreamError::QueueSaturation
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Signaling(e.to_string())
    }
}
