//! Audio capture and playback for the voice session
//!
//! Capture and playback run on a dedicated device thread that owns the CPAL
//! streams. Captured audio is framed into fixed-duration PCM16 frames and
//! pushed into a bounded drop-oldest `FrameQueue`; inbound frames are queued
//! into a jitter buffer that the output callback drains.

mod capture;
mod convert;
mod device;
mod frame_queue;
mod playback;

use std::time::Instant;

use serde::Serialize;

pub use capture::FrameAssembler;
pub use convert::{downsample, pcm16_from_le_bytes, pcm16_to_le_bytes, to_mono};
pub use device::{AudioBackend, AudioConfig, CpalAudio};
pub use frame_queue::FrameQueue;
pub use playback::{AudioSink, PlaybackBuffer, PlaybackStats, SequenceRegression, SharedPlayback};

/// Errors from the audio hardware (DeviceError)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    UnsupportedSampleRate { device: u32, target: u32 },
    StreamCreationFailed(String),
    StreamFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::UnsupportedSampleRate { device, target } => write!(
                f,
                "Device rate {}Hz cannot be converted to {}Hz",
                device, target
            ),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::StreamFailed(e) => write!(f, "Audio stream failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// Direction of an audio frame relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Assistant audio received from the speech service
    Inbound,
    /// Microphone audio sent to the speech service
    Outbound,
}

/// A fixed chunk of PCM16 mono audio
#[derive(Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub direction: Direction,
    /// Monotonically increasing within a direction
    pub sequence: u64,
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, direction: Direction, sequence: u64) -> Self {
        Self {
            samples,
            direction,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / sample_rate as u64
    }
}

// Sample payloads are too large for event logs
impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("direction", &self.direction)
            .field("sequence", &self.sequence)
            .field("samples", &self.samples.len())
            .finish()
    }
}
