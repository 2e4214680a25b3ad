//! OpenAI Realtime API protocol types
//!
//! This module defines the JSON message types for talking to the OpenAI
//! Realtime API over WebSocket, and maps inbound messages onto the abstract
//! service events the controller understands.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://api.openai.com/v1/realtime?model=...`
//! 2. Receive `session.created`
//! 3. Send `session.update` (voice, server VAD, input transcription)
//! 4. Stream microphone audio via `input_audio_buffer.append`
//! 5. Receive VAD boundaries and user transcripts
//! 6. Send `response.create` per completed user turn; receive
//!    `response.audio.delta` chunks until `response.done`
//! 7. Send `response.cancel` on barge-in

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::audio::{pcm16_from_le_bytes, pcm16_to_le_bytes, AudioFrame, Direction};
use crate::state_machine::{ServiceEvent, Speaker, TranscriptEvent};

/// OpenAI Realtime API endpoint (model appended as a query parameter)
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Error code the service returns when a cancel finds nothing to cancel
const CANCEL_NOT_ACTIVE: &str = "response_cancel_not_active";

/// Session configuration for the Realtime API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System prompt for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Must be "pcm16" for raw PCM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: Some(vec!["audio".to_string(), "text".to_string()]),
            instructions: None,
            voice: Some("shimmer".to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
                language: Some("ja".to_string()),
            }),
            turn_detection: Some(TurnDetection::default()),
            temperature: Some(0.7),
            max_response_output_tokens: Some(100),
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Server-side voice activity detection.
///
/// Responses are requested explicitly by the controller, so the service is
/// told not to create or interrupt responses on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
    pub interrupt_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold: 0.85,
            prefix_padding_ms: 700,
            silence_duration_ms: 1500,
            create_response: false,
            interrupt_response: false,
        }
    }
}

/// Per-response overrides for `response.create`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Session information returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,

    #[serde(default)]
    pub model: String,
}

/// Error information from the API
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

/// Response information carried by `response.created` / `response.done`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,

    /// "in_progress", "completed", "cancelled", "failed" or "incomplete"
    #[serde(default)]
    pub status: Option<String>,
}

// ============================================================================
// Client Messages (sent TO OpenAI)
// ============================================================================

/// Messages sent from client to OpenAI Realtime API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio data to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    /// Create an audio append message from raw PCM16 samples
    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AudioAppend {
            audio: STANDARD.encode(pcm16_to_le_bytes(samples)),
        }
    }

    /// Request a response, optionally with instructions for this one only
    pub fn response_create(instructions: Option<String>) -> Self {
        Self::ResponseCreate {
            response: instructions.map(|instructions| ResponseOptions {
                modalities: None,
                instructions: Some(instructions),
            }),
        }
    }

    pub fn response_cancel(response_id: Option<String>) -> Self {
        Self::ResponseCancel { response_id }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionUpdate { .. } => "session.update",
            ClientMessage::AudioAppend { .. } => "input_audio_buffer.append",
            ClientMessage::ResponseCreate { .. } => "response.create",
            ClientMessage::ResponseCancel { .. } => "response.cancel",
        }
    }
}

// ============================================================================
// Server Messages (received FROM OpenAI)
// ============================================================================

/// Messages received from OpenAI Realtime API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Input audio buffer speech started (VAD detected speech)
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    /// Input audio buffer speech stopped (VAD detected silence)
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// Partial transcription of user speech
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptDelta { delta: String },

    /// Final transcription of user speech
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted { transcript: String },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptFailed {
        #[serde(default)]
        error: Option<ErrorInfo>,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    /// Base64 PCM16 chunk of assistant audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },

    /// Catch-all for message types we don't handle
    /// This prevents deserialization failures for unknown types
    #[serde(other)]
    Unknown,
}

/// Maps inbound JSON text onto `ServiceEvent`s.
///
/// Assigns monotonically increasing sequence numbers to inbound audio. The
/// decoder lives as long as the connection manager, so sequences keep
/// increasing across reconnects.
#[derive(Debug, Default)]
pub struct InboundDecoder {
    next_sequence: u64,
}

impl InboundDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one text message.
    ///
    /// `Ok(None)` means the message carries nothing for the controller;
    /// `Err` is a protocol fault for that message only.
    pub fn decode(&mut self, text: &str) -> Result<Option<ServiceEvent>, String> {
        let msg = serde_json::from_str::<ServerMessage>(text)
            .map_err(|e| format!("malformed server event: {}", e))?;
        self.map(msg)
    }

    pub fn map(&mut self, msg: ServerMessage) -> Result<Option<ServiceEvent>, String> {
        let event = match msg {
            ServerMessage::SessionCreated { session } | ServerMessage::SessionUpdated { session } => {
                log::debug!("Session event for {}", session.id);
                return Ok(None);
            }
            ServerMessage::Error { error } => {
                if error.code.as_deref() == Some(CANCEL_NOT_ACTIVE) {
                    ServiceEvent::CancelNotActive
                } else {
                    ServiceEvent::ServiceError {
                        code: error.code,
                        message: error.message,
                    }
                }
            }
            ServerMessage::SpeechStarted { .. } => ServiceEvent::SpeechStarted,
            ServerMessage::SpeechStopped { .. } => ServiceEvent::SpeechStopped,
            ServerMessage::TranscriptDelta { delta } => {
                ServiceEvent::Transcript(TranscriptEvent::delta(Speaker::User, delta))
            }
            ServerMessage::TranscriptCompleted { transcript } => {
                ServiceEvent::Transcript(TranscriptEvent::final_text(Speaker::User, transcript))
            }
            ServerMessage::TranscriptFailed { error } => ServiceEvent::TranscriptionFailed {
                message: error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "transcription failed".to_string()),
            },
            ServerMessage::ResponseCreated { response } => match response.id {
                Some(response_id) => ServiceEvent::ResponseStarted { response_id },
                None => return Err("response.created without a response id".to_string()),
            },
            ServerMessage::AudioDelta { delta, .. } => {
                let bytes = STANDARD
                    .decode(delta.as_bytes())
                    .map_err(|e| format!("invalid base64 audio: {}", e))?;
                let samples = pcm16_from_le_bytes(&bytes)
                    .ok_or_else(|| format!("odd PCM16 byte count: {}", bytes.len()))?;
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                ServiceEvent::ResponseAudio(AudioFrame::new(samples, Direction::Inbound, sequence))
            }
            ServerMessage::AudioTranscriptDelta { delta } => {
                ServiceEvent::Transcript(TranscriptEvent::delta(Speaker::Assistant, delta))
            }
            ServerMessage::AudioTranscriptDone { transcript } => ServiceEvent::Transcript(
                TranscriptEvent::final_text(Speaker::Assistant, transcript),
            ),
            ServerMessage::ResponseDone { response } => match response.status.as_deref() {
                Some("cancelled") => ServiceEvent::CancelAcknowledged {
                    response_id: response.id,
                },
                status => {
                    if matches!(status, Some("failed") | Some("incomplete")) {
                        log::warn!("Response {:?} ended with status {:?}", response.id, status);
                    }
                    ServiceEvent::ResponseDone {
                        response_id: response.id,
                    }
                }
            },
            ServerMessage::Unknown => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
