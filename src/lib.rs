//! Duplex realtime voice session for a daily spoken check-in.
//!
//! One `VoiceSession` captures microphone audio, streams it to a realtime
//! speech service, plays the assistant's spoken replies and keeps the turn
//! state (including barge-in) until a closing phrase, a limit or a fatal
//! error ends the conversation. The finished `SessionResult` is the only
//! artifact handed to downstream collaborators.

pub mod audio;
pub mod classify;
pub mod controller;
pub mod effects;
pub mod error;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use audio::{AudioBackend, AudioConfig, AudioError, CpalAudio};
pub use error::SessionError;
pub use metrics::SessionStats;
pub use session::{deliver, ResultHandler, SessionHandle, SessionResult, VoiceSession};
pub use settings::{load_settings, save_settings, SessionSettings};
pub use state_machine::{EndReason, Outcome, Speaker, TurnState, Utterance};
pub use streaming::{get_api_key, ConnectionError, Connector, WsConnector};
