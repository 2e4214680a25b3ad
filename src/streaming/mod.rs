//! Realtime speech service connection
//!
//! This module owns the WebSocket session with the OpenAI Realtime API:
//! wire codec, connection lifecycle and reconnect supervision.
//!
//! # Architecture
//!
//! ```text
//! FrameQueue ──▶ ConnectionManager pump ──▶ Link (WebSocket)
//!                      │    ▲                     │
//!        control msgs ─┘    └──── InboundDecoder ◀┘
//!                                      │
//!                                      ▼
//!                              controller Event channel
//! ```
//!
//! # Reconnect Strategy
//!
//! - Initial `open` retries with exponential backoff
//! - Mid-session drops reconnect with the same bounded backoff and replay the
//!   session handshake
//! - Exceeding the retry ceiling surfaces `RetriesExhausted` to the controller

mod connection;
mod protocol;
mod realtime_client;
mod transcript_aggregator;

use serde::Serialize;

pub use connection::{establish, BoxLink, ConnectionConfig, ConnectionManager, Connector, Link};
pub use protocol::{
    ClientMessage, InboundDecoder, ResponseOptions, ServerMessage, SessionConfig,
    TranscriptionConfig, TurnDetection, DEFAULT_MODEL, DEFAULT_REALTIME_URL,
};
pub use realtime_client::{get_api_key, WsConnector, WsLink};
pub use transcript_aggregator::TranscriptAggregator;

/// Errors from the transport to the speech service (TransportError)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectionError {
    /// OpenAI API key not configured
    MissingApiKey,
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// Authentication with OpenAI failed
    AuthenticationFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to write to the socket
    SendFailed(String),
    /// The manager was closed; no further sends are accepted
    Closed,
    /// Reconnect ceiling exceeded
    RetriesExhausted { attempts: u32, last: String },
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::MissingApiKey => {
                write!(
                    f,
                    "OpenAI API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            ConnectionError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to OpenAI Realtime API: {}", e)
            }
            ConnectionError::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", e)
            }
            ConnectionError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            ConnectionError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            ConnectionError::SendFailed(e) => {
                write!(f, "Failed to send: {}", e)
            }
            ConnectionError::Closed => write!(f, "Connection is closed"),
            ConnectionError::RetriesExhausted { attempts, last } => {
                write!(
                    f,
                    "Gave up reconnecting after {} attempts: {}",
                    attempts, last
                )
            }
        }
    }
}

impl std::error::Error for ConnectionError {}
