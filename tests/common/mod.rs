//! In-memory speech service and audio backends for session tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use mimamori::audio::{
    pcm16_to_le_bytes, AudioBackend, AudioConfig, AudioError, AudioSink, FrameQueue,
    SharedPlayback,
};
use mimamori::streaming::{BoxLink, ConnectionError, Connector, Link};
use mimamori::SessionSettings;

pub const WAIT: Duration = Duration::from_secs(5);

/// Settings tuned for fast, deterministic tests
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        greeting_enabled: false,
        reconnect_base_delay_ms: 1,
        connect_timeout_ms: 1_000,
        response_timeout_ms: 2_000,
        playback_prebuffer_ms: 0,
        speak_delay_ms: 0,
        response_cooldown_ms: 0,
        ..SessionSettings::default()
    }
}

// ============================================================================
// Scripted service
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Plan {
    Accept,
    Refuse,
}

struct ScriptedLink {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Link for ScriptedLink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
        let result = self
            .outbound
            .send(text)
            .map_err(|_| ConnectionError::SendFailed("peer gone".into()));
        Box::pin(async move { result })
    }

    fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>> {
        Box::pin(async move { self.inbound.recv().await.map(Ok) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inbound.close();
        Box::pin(async {})
    }
}

/// Connector that follows a fixed plan; refuses once the plan runs out
pub struct ScriptedConnector {
    plans: Mutex<VecDeque<Plan>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl ScriptedConnector {
    pub fn new(plans: &[Plan]) -> (Arc<Self>, Servers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(plans.iter().copied().collect()),
            accepted: tx,
        });
        (connector, Servers { rx })
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxLink, ConnectionError>> {
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Refuse);
        Box::pin(async move {
            if plan == Plan::Refuse {
                return Err(ConnectionError::ConnectionFailed("connection refused".into()));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let server = ServerEnd {
                to_client,
                from_client,
            };
            server.send(json!({"type": "session.created", "session": {"id": "sess_test"}}));
            let _ = self.accepted.send(server);
            Ok(Box::new(ScriptedLink { inbound, outbound }) as BoxLink)
        })
    }
}

/// Accepted connections, in order
pub struct Servers {
    rx: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Servers {
    pub async fn next(&mut self) -> ServerEnd {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

/// Service side of one accepted connection. Dropping it drops the link.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send(&self, msg: Value) {
        let _ = self.to_client.send(msg.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(text.to_string());
    }

    /// Next client message that is not an audio append
    pub async fn next_control(&mut self) -> Value {
        loop {
            let text = timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for a client message")
                .expect("client closed the connection");
            let value: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
            if value["type"] != "input_audio_buffer.append" {
                return value;
            }
        }
    }

    /// Next control message within `within`, if any
    pub async fn try_next_control(&mut self, within: Duration) -> Option<Value> {
        loop {
            let text = timeout(within, self.from_client.recv()).await.ok()??;
            let value: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
            if value["type"] != "input_audio_buffer.append" {
                return Some(value);
            }
        }
    }

    /// Next client message of any type, audio included
    pub async fn next_raw(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client closed the connection");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Read control messages until one of type `kind`; panics on anything else
    pub async fn expect(&mut self, kind: &str) -> Value {
        let msg = self.next_control().await;
        assert_eq!(msg["type"], kind, "unexpected client message: {}", msg);
        msg
    }

    /// Wait until the client closes its side
    pub async fn closed(&mut self) {
        timeout(WAIT, async {
            while self.from_client.recv().await.is_some() {}
        })
        .await
        .expect("client never closed the connection");
    }

    pub fn speech_started(&self) {
        self.send(json!({"type": "input_audio_buffer.speech_started", "audio_start_ms": 0}));
    }

    pub fn speech_stopped(&self) {
        self.send(json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 900}));
    }

    pub fn user_delta(&self, delta: &str) {
        self.send(json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "item_id": "item_1",
            "delta": delta
        }));
    }

    pub fn user_final(&self, transcript: &str) {
        self.send(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_1",
            "transcript": transcript
        }));
    }

    pub fn transcription_failed(&self) {
        self.send(json!({
            "type": "conversation.item.input_audio_transcription.failed",
            "error": {"type": "server_error", "message": "audio unclear"}
        }));
    }

    pub fn response_created(&self, id: &str) {
        self.send(json!({"type": "response.created", "response": {"id": id, "status": "in_progress"}}));
    }

    pub fn audio(&self, id: &str, samples: &[i16]) {
        self.send(json!({
            "type": "response.audio.delta",
            "response_id": id,
            "delta": STANDARD.encode(pcm16_to_le_bytes(samples))
        }));
    }

    pub fn assistant_text(&self, transcript: &str) {
        self.send(json!({"type": "response.audio_transcript.done", "transcript": transcript}));
    }

    pub fn response_done(&self, id: &str, status: &str) {
        self.send(json!({"type": "response.done", "response": {"id": id, "status": status}}));
    }

    /// A complete assistant reply: created, one audio chunk, transcript, done
    pub fn reply(&self, id: &str, text: &str) {
        self.response_created(id);
        self.audio(id, &[500; 480]);
        self.assistant_text(text);
        self.response_done(id, "completed");
    }
}

// ============================================================================
// Audio backends
// ============================================================================

/// No hardware: playback goes into an inspectable buffer
#[derive(Clone)]
pub struct NullAudio {
    pub playback: SharedPlayback,
    failures: Arc<Mutex<Option<mpsc::UnboundedSender<AudioError>>>>,
    frames: Arc<Mutex<Option<Arc<FrameQueue>>>>,
}

impl NullAudio {
    pub fn new() -> Self {
        Self {
            playback: SharedPlayback::new(24_000, 0),
            failures: Arc::new(Mutex::new(None)),
            frames: Arc::new(Mutex::new(None)),
        }
    }

    /// Report a runtime device failure, as a dying stream would
    pub fn fail(&self, err: AudioError) {
        if let Some(tx) = self.failures.lock().unwrap().as_ref() {
            let _ = tx.send(err);
        }
    }

    /// Push one captured frame, as the microphone would
    pub fn capture(&self, samples: Vec<i16>) -> Option<u64> {
        self.frames.lock().unwrap().as_ref()?.push(samples)
    }
}

impl AudioBackend for NullAudio {
    fn start(
        &mut self,
        _config: AudioConfig,
        frames: Arc<FrameQueue>,
        failures: mpsc::UnboundedSender<AudioError>,
    ) -> BoxFuture<'static, Result<Arc<dyn AudioSink>, AudioError>> {
        *self.failures.lock().unwrap() = Some(failures);
        *self.frames.lock().unwrap() = Some(frames);
        let sink: Arc<dyn AudioSink> = Arc::new(self.playback.clone());
        Box::pin(async move { Ok(sink) })
    }

    fn stop(&mut self) {
        self.failures.lock().unwrap().take();
    }
}

/// No microphone available
pub struct FailingAudio;

impl AudioBackend for FailingAudio {
    fn start(
        &mut self,
        _config: AudioConfig,
        _frames: Arc<FrameQueue>,
        _failures: mpsc::UnboundedSender<AudioError>,
    ) -> BoxFuture<'static, Result<Arc<dyn AudioSink>, AudioError>> {
        Box::pin(async { Err(AudioError::NoInputDevice) })
    }

    fn stop(&mut self) {}
}
