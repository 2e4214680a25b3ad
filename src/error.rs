//! Session-level error taxonomy
//!
//! Component errors (`AudioError`, `ConnectionError`) stay in their own modules.
//! `SessionError` is the structured reason carried by a failed `SessionResult`.
//! Cancel races are not errors and never appear here.

use serde::Serialize;

use crate::audio::AudioError;
use crate::streaming::ConnectionError;

/// Fatal reasons a session can end with `failed`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    /// Settings rejected before the session started
    Config(String),
    /// Audio hardware unavailable or failed mid-session
    Device(AudioError),
    /// Connection lost and the reconnect ceiling was exceeded
    Transport(ConnectionError),
    /// Malformed or unexpected inbound events recurred beyond the threshold
    Protocol(String),
    /// An open response produced no terminal event within the window
    StallTimeout { after_ms: u64 },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Config(e) => write!(f, "Invalid settings: {}", e),
            SessionError::Device(e) => write!(f, "Audio device error: {}", e),
            SessionError::Transport(e) => write!(f, "Transport error: {}", e),
            SessionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SessionError::StallTimeout { after_ms } => {
                write!(f, "Response stalled: no terminal event after {}ms", after_ms)
            }
        }
    }
}

impl std::error::Error for SessionError {}
