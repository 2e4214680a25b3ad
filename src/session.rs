//! Session façade
//!
//! Starts one check-in conversation, runs it to termination and returns the
//! `SessionResult`. This is the only surface downstream collaborators see.
//!
//! # Lifecycle
//!
//! 1. Validate settings
//! 2. Start audio (capture feeds the frame queue, playback sink returned)
//! 3. Open the service connection
//! 4. Run the controller until the session terminates
//! 5. Tear down in reverse order and fold component counters into the stats

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioBackend, FrameQueue};
use crate::controller::run_controller;
use crate::effects::SessionEffectRunner;
use crate::error::SessionError;
use crate::metrics::SessionStats;
use crate::settings::SessionSettings;
use crate::state_machine::{
    EndReason, Event, Outcome, Session, SessionEnd, TerminationSignal, Utterance,
};
use crate::streaming::{ConnectionManager, Connector};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Finished session, handed to downstream collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub outcome: Outcome,
    pub reason: EndReason,
    pub transcript: Vec<Utterance>,
    pub termination: Option<TerminationSignal>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stats: SessionStats,
}

impl SessionResult {
    fn ended_before_start(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        outcome: Outcome,
        reason: EndReason,
    ) -> Self {
        Self {
            session_id,
            outcome,
            reason,
            transcript: Vec::new(),
            termination: None,
            started_at,
            ended_at: Utc::now(),
            stats: SessionStats::default(),
        }
    }

    fn failed_before_start(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        error: SessionError,
    ) -> Self {
        Self::ended_before_start(
            session_id,
            started_at,
            Outcome::Failed,
            EndReason::Fatal { error },
        )
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// Receives the finished result (emotion analysis, persistence, notification).
pub trait ResultHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, result: &SessionResult) -> Result<(), String>;
}

/// Hand `result` to each handler in order. Handler errors are logged, never
/// propagated. Returns how many handlers succeeded.
pub fn deliver(result: &SessionResult, handlers: &[Box<dyn ResultHandler>]) -> usize {
    let mut delivered = 0;
    for handler in handlers {
        match handler.handle(result) {
            Ok(()) => {
                log::debug!("Result delivered to {}", handler.name());
                delivered += 1;
            }
            Err(e) => log::error!("Result handler {} failed: {}", handler.name(), e),
        }
    }
    delivered
}

/// Opening instructions greeting the user by time of day
pub fn greeting_instructions(hour: u32, minute: u32) -> String {
    let prefix = match hour {
        6..=11 => "おはようございます",
        12..=17 => "こんにちは",
        _ => "こんばんは",
    };
    format!(
        "次の挨拶をそのまま、ゆっくり優しく伝えてください。「{}、現在の時刻は{}時{}分です。今日のお加減はいかがでしょうか？」",
        prefix, hour, minute
    )
}

/// Handle to a session running on the runtime
pub struct SessionHandle {
    stop: CancellationToken,
    join: JoinHandle<SessionResult>,
}

impl SessionHandle {
    /// Request external cancellation. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<SessionResult, JoinError> {
        self.join.await
    }
}

pub struct VoiceSession {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    audio: Box<dyn AudioBackend>,
}

impl VoiceSession {
    pub fn new(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        audio: Box<dyn AudioBackend>,
    ) -> Self {
        Self {
            settings,
            connector,
            audio,
        }
    }

    /// Run to termination without external cancellation
    pub async fn start(self) -> SessionResult {
        self.run(CancellationToken::new()).await
    }

    /// Run on the runtime; the handle can stop and await it
    pub fn spawn(self) -> SessionHandle {
        let stop = CancellationToken::new();
        let join = tokio::spawn(self.run(stop.clone()));
        SessionHandle { stop, join }
    }

    /// Run to termination. Cancelling `stop` ends the session as requested
    /// by the user.
    pub async fn run(mut self, stop: CancellationToken) -> SessionResult {
        let id = Uuid::new_v4();
        let started = Instant::now();
        let started_at = Utc::now();
        log::info!("Session {} starting", id);

        if let Err(e) = self.settings.validate() {
            log::error!("Session {}: {}", id, e);
            return SessionResult::failed_before_start(id, started_at, e);
        }

        // Audio
        let frames = Arc::new(FrameQueue::new(self.settings.capture_queue_frames));
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let sink = match self
            .audio
            .start(self.settings.audio_config(), frames.clone(), failures_tx)
            .await
        {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("Session {}: audio failed to start: {}", id, e);
                self.audio.stop();
                return SessionResult::failed_before_start(id, started_at, SessionError::Device(e));
            }
        };

        // Connection
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let opened = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            result = ConnectionManager::open(
                self.connector.clone(),
                self.settings.connection_config(),
                frames.clone(),
                tx.clone(),
            ) => Some(result),
        };
        let connection = match opened {
            Some(Ok(connection)) => Arc::new(connection),
            Some(Err(e)) => {
                log::error!("Session {}: connection failed: {}", id, e);
                frames.close();
                self.audio.stop();
                return SessionResult::failed_before_start(
                    id,
                    started_at,
                    SessionError::Transport(e),
                );
            }
            None => {
                log::info!("Session {} stopped before the connection opened", id);
                frames.close();
                self.audio.stop();
                return SessionResult::ended_before_start(
                    id,
                    started_at,
                    Outcome::Completed,
                    EndReason::Cancelled,
                );
            }
        };

        // Device failures surface as events
        let device_tx = tx.clone();
        let device_watch = tokio::spawn(async move {
            if let Some(err) = failures_rx.recv().await {
                let _ = device_tx.send(Event::DeviceFailed(err)).await;
            }
        });

        let tick_tx = tx.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick_tx
                    .send(Event::Tick {
                        now: Instant::now(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let greeting = self.settings.greeting_enabled.then(|| {
            let now = Local::now();
            greeting_instructions(now.hour(), now.minute())
        });
        let _ = tx.send(Event::Begin { greeting }).await;

        let runner = SessionEffectRunner::new(connection.clone(), sink.clone());
        let session = run_controller(
            Session::new(id, started),
            self.settings.turn_policy(),
            rx,
            tx,
            runner,
            stop,
        )
        .await;

        // Teardown
        ticker.abort();
        device_watch.abort();
        frames.close();
        connection.close();
        connection.wait_closed().await;
        self.audio.stop();

        let termination = session.termination().cloned();
        let started_at = session.started_at;
        let (transcript, end, mut stats) = session.into_parts();
        stats.record_capture(frames.pushed(), frames.dropped());
        stats.record_sent(connection.frames_sent());
        stats.record_playback(&sink.stats());

        let end = end.unwrap_or_else(|| {
            log::error!("Session {}: controller returned without an end", id);
            SessionEnd {
                outcome: Outcome::Failed,
                reason: EndReason::Cancelled,
            }
        });

        log::info!(
            "Session {} ended: {:?} ({}), {} utterances, {:.1}% frames dropped",
            id,
            end.outcome,
            end.reason,
            transcript.len(),
            stats.drop_ratio() * 100.0
        );

        SessionResult {
            session_id: id,
            outcome: end.outcome,
            reason: end.reason,
            transcript,
            termination,
            started_at,
            ended_at: Utc::now(),
            stats,
        }
    }
}
