//! Domain-specific error types for the remote-control engine.
//!
//! Every fallible step inside the engine returns `Result<T, RccError>`.
//! The engine boundary converts these into connection-state transitions
//! and bus events; callers of `send` never see them.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the remote-control engine.
#[derive(Debug, Error)]
pub enum RccError {
    // ── Framing Errors ───────────────────────────────────────────
    /// The peer announced a frame with a negative payload length.
    #[error("negative frame length: {0}")]
    NegativeLength(i32),

    /// The peer announced (or we tried to send) a frame above the limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted without an open connection.
    #[error("not connected")]
    NotConnected,

    /// Establishing the TCP connection took too long.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The engine was used in a way the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Payload Errors ───────────────────────────────────────────
    /// A markup payload could not be parsed or rewritten.
    #[error("malformed markup: {0}")]
    Markup(String),

    // ── Setup Errors ─────────────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine was created outside of a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    // ── Relay Errors ─────────────────────────────────────────────
    /// The alternate (relay) transport failed or is not installed.
    #[error("relay error: {0}")]
    Relay(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for RccError {
    fn from(s: String) -> Self {
        RccError::Other(s)
    }
}

impl From<&str> for RccError {
    fn from(s: &str) -> Self {
        RccError::Other(s.to_string())
    }
}

impl From<quick_xml::Error> for RccError {
    fn from(e: quick_xml::Error) -> Self {
        RccError::Markup(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for RccError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        RccError::Markup(e.to_string())
    }
}
