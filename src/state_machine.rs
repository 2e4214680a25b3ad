//! Turn/state machine for a duplex voice session
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through `reduce()`, which mutates the `Session`
//! owned by the controller loop and returns a list of effects to execute.
//! Nothing else reads or writes session state while the session runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audio::{AudioError, AudioFrame};
use crate::classify::{FillerClassifier, TerminationDetector};
use crate::error::SessionError;
use crate::metrics::SessionStats;
use crate::streaming::{ConnectionError, TranscriptAggregator};

/// Turn state of the conversation.
/// `Idle` is initial, `Terminated` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    UserSpeaking,
    AiResponding,
    BargeInCancelling,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// A finalized line of the conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A transcript fragment from the speech service
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub text: String,
    /// Non-final events are deltas; one final event closes an utterance
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn delta(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Waiting out the cooldown after the previous response; not yet requested
    Deferred,
    Pending,
    Streaming,
    Cancelled,
    Completed,
}

/// One assistant response.
/// At most one may be `Pending` or `Streaming` at any time.
#[derive(Debug, Clone)]
pub struct ResponseStream {
    /// Local sequence, used to detect stale timers
    pub seq: u64,
    /// Identifier assigned by the service once the response starts
    pub remote_id: Option<String>,
    pub state: ResponseState,
    /// Held until a deferred response is requested
    instructions: Option<String>,
    text: TranscriptAggregator,
}

impl ResponseStream {
    fn new(seq: u64, state: ResponseState, instructions: Option<String>) -> Self {
        Self {
            seq,
            remote_id: None,
            state,
            instructions,
            text: TranscriptAggregator::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ResponseState::Deferred | ResponseState::Pending | ResponseState::Streaming
        )
    }

    /// Sent to the service and not yet finished
    fn is_live(&self) -> bool {
        matches!(self.state, ResponseState::Pending | ResponseState::Streaming)
    }

    pub fn text(&self) -> &str {
        self.text.current_text()
    }
}

/// Set at most once per session when a closing phrase is recognized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationSignal {
    pub phrase: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

/// Why the session reached `Terminated`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    PhraseMatched { phrase: String },
    Fatal { error: SessionError },
    /// External stop request
    Cancelled,
    MaxDuration,
    IdleTimeout,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::PhraseMatched { phrase } => write!(f, "termination phrase {:?}", phrase),
            EndReason::Fatal { error } => write!(f, "fatal error: {}", error),
            EndReason::Cancelled => write!(f, "stop requested"),
            EndReason::MaxDuration => write!(f, "maximum session duration reached"),
            EndReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {
    pub outcome: Outcome,
    pub reason: EndReason,
}

/// Abstract events decoded from the speech service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Server VAD detected the start of user speech
    SpeechStarted,
    SpeechStopped,
    Transcript(TranscriptEvent),
    /// User speech could not be transcribed
    TranscriptionFailed { message: String },
    ResponseStarted { response_id: String },
    ResponseAudio(AudioFrame),
    ResponseDone { response_id: Option<String> },
    CancelAcknowledged { response_id: Option<String> },
    /// The cancel arrived after the response had already finished
    CancelNotActive,
    ServiceError { code: Option<String>, message: String },
}

/// Events that can trigger state transitions.
/// Sent by the connection pump, the audio thread, timers and the façade.
#[derive(Debug, Clone)]
pub enum Event {
    /// Session started; optionally open with a greeting response
    Begin { greeting: Option<String> },
    Service(ServiceEvent),

    // Transport events
    Reconnecting { attempt: u32, max_attempts: u32 },
    Reconnected,
    TransportFailed(ConnectionError),

    DeviceFailed(AudioError),
    /// Malformed inbound data or a playback ordering violation
    ProtocolFault(String),

    /// Response stall timer fired (includes seq to prevent stale timeouts)
    ResponseTimeout { seq: u64 },
    /// Cooldown before a deferred response is over
    CooldownElapsed { seq: u64 },
    /// Once per second while the session runs
    Tick { now: Instant },
    /// External stop request
    Stop,
}

/// Effects to be executed after a transition.
/// The effect runner handles these against the connection and playback.
#[derive(Debug, Clone)]
pub enum Effect {
    RequestResponse {
        seq: u64,
        instructions: Option<String>,
    },
    CancelResponse {
        response_id: Option<String>,
    },
    ArmResponseTimer {
        seq: u64,
        after: Duration,
    },
    ArmCooldownTimer {
        seq: u64,
        after: Duration,
    },
    PlayAudio(AudioFrame),
    /// No more audio for the current response
    FinishPlayback,
    FlushPlayback,
    CloseConnection,
}

/// Classifiers and limits consulted by the reducer
#[derive(Debug, Clone)]
pub struct TurnPolicy {
    pub filler: FillerClassifier,
    pub termination: TerminationDetector,
    pub response_timeout: Duration,
    /// Minimum gap between the end of one response and the next request
    pub response_cooldown: Duration,
    /// Faults tolerated before the session fails
    pub max_protocol_faults: u32,
    pub max_session: Duration,
    /// `None` disables the idle timeout
    pub idle_timeout: Option<Duration>,
    /// Instructions for the response sent when user speech was not understood
    pub repeat_request_instructions: String,
}

/// How the current user turn's final transcript was judged.
/// The text itself stays in the turn's aggregator.
#[derive(Debug, Clone, Copy, PartialEq)]
enum UserFinal {
    Filler,
    Content,
}

/// Session state. Owned exclusively by the controller.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    state: TurnState,
    pub started_at: DateTime<Utc>,
    started: Instant,
    transcript: Vec<Utterance>,
    response: Option<ResponseStream>,
    next_response_seq: u64,

    // Current user turn
    user_text: TranscriptAggregator,
    user_final: Option<UserFinal>,
    speech_stopped: bool,
    transcription_failed: bool,

    /// Assistant audio has been handed to playback since the last flush
    playback_active: bool,
    last_activity: Instant,
    last_response_end: Option<Instant>,
    termination: Option<TerminationSignal>,
    end: Option<SessionEnd>,
    pub stats: SessionStats,
}

impl Session {
    pub fn new(id: Uuid, now: Instant) -> Self {
        Self {
            id,
            state: TurnState::Idle,
            started_at: Utc::now(),
            started: now,
            transcript: Vec::new(),
            response: None,
            next_response_seq: 0,
            user_text: TranscriptAggregator::new(),
            user_final: None,
            speech_stopped: false,
            transcription_failed: false,
            playback_active: false,
            last_activity: now,
            last_response_end: None,
            termination: None,
            end: None,
            stats: SessionStats::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transcript(&self) -> &[Utterance] {
        &self.transcript
    }

    pub fn response(&self) -> Option<&ResponseStream> {
        self.response.as_ref()
    }

    pub fn termination(&self) -> Option<&TerminationSignal> {
        self.termination.as_ref()
    }

    pub fn end(&self) -> Option<&SessionEnd> {
        self.end.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TurnState::Terminated
    }

    /// Consume the session, yielding the transcript and stats
    pub fn into_parts(self) -> (Vec<Utterance>, Option<SessionEnd>, SessionStats) {
        (self.transcript, self.end, self.stats)
    }

    fn transition(&mut self, next: TurnState) {
        if self.state != next {
            log::info!("State transition: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn append(&mut self, speaker: Speaker, text: String) {
        log::info!("{:?}: {}", speaker, text);
        self.transcript.push(Utterance {
            speaker,
            text,
            timestamp: Utc::now(),
        });
    }

    fn reset_user_turn(&mut self) {
        self.user_text.reset();
        self.user_final = None;
        self.speech_stopped = false;
        self.transcription_failed = false;
    }

    fn has_open_response(&self) -> bool {
        self.response.as_ref().map_or(false, |r| r.is_open())
    }

    fn close_open_response(&mut self) {
        if let Some(r) = self.response.as_mut() {
            if r.is_open() {
                // A deferred response never reached the service
                if r.state != ResponseState::Deferred {
                    self.stats.responses_cancelled += 1;
                }
                r.state = ResponseState::Cancelled;
                r.instructions = None;
            }
        }
    }
}

/// Reducer function: (session, event) -> effects
///
/// Key rules:
/// - Only this function mutates session state
/// - Events after `Terminated` are ignored
/// - Timers carry the response seq; stale timers are ignored
pub fn reduce(session: &mut Session, policy: &TurnPolicy, event: Event) -> Vec<Effect> {
    if session.is_terminated() {
        log::debug!("Session terminated, ignoring {:?}", event);
        return vec![];
    }

    match event {
        Event::Begin { greeting } => match greeting {
            Some(instructions) if session.state == TurnState::Idle => {
                log::info!("Opening with greeting");
                start_response(session, policy, Some(instructions))
            }
            _ => vec![],
        },
        Event::Service(service) => on_service(session, policy, service),
        Event::Reconnecting {
            attempt,
            max_attempts,
        } => {
            log::warn!(
                "Connection lost, reconnecting (attempt {}/{})",
                attempt,
                max_attempts
            );
            on_connection_lost(session)
        }
        Event::Reconnected => on_reconnected(session),
        Event::TransportFailed(err) => fail(session, SessionError::Transport(err)),
        Event::DeviceFailed(err) => fail(session, SessionError::Device(err)),
        Event::ProtocolFault(message) => protocol_fault(session, policy, message),
        Event::ResponseTimeout { seq } => match session.response.as_ref() {
            Some(r) if r.seq == seq && r.is_open() => {
                let after_ms = policy.response_timeout.as_millis() as u64;
                fail(session, SessionError::StallTimeout { after_ms })
            }
            _ => {
                log::debug!("Ignoring stale response timeout (seq={})", seq);
                vec![]
            }
        },
        Event::CooldownElapsed { seq } => match session.response.as_mut() {
            Some(r) if r.seq == seq && r.state == ResponseState::Deferred => {
                r.state = ResponseState::Pending;
                let instructions = r.instructions.take();
                request_response(session, policy, seq, instructions)
            }
            _ => {
                log::debug!("Ignoring stale cooldown (seq={})", seq);
                vec![]
            }
        },
        Event::Tick { now } => on_tick(session, policy, now),
        Event::Stop => {
            // Stopping between turns is a normal end; mid-turn it is a failure
            let outcome = if session.state == TurnState::Idle {
                Outcome::Completed
            } else {
                Outcome::Failed
            };
            terminate(session, outcome, EndReason::Cancelled)
        }
    }
}

fn on_service(session: &mut Session, policy: &TurnPolicy, event: ServiceEvent) -> Vec<Effect> {
    use ServiceEvent::*;
    use TurnState::*;

    match (session.state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, SpeechStarted) => {
            session.reset_user_turn();
            let mut effects = vec![];
            // Tail of the previous response may still be playing
            if session.playback_active {
                session.playback_active = false;
                effects.push(Effect::FlushPlayback);
            }
            session.transition(UserSpeaking);
            effects
        }

        // -----------------
        // UserSpeaking / BargeInCancelling: user turn in progress
        // -----------------
        (UserSpeaking | BargeInCancelling, SpeechStarted) => vec![],
        (UserSpeaking | BargeInCancelling, SpeechStopped) => {
            session.speech_stopped = true;
            try_complete_turn(session, policy)
        }
        (UserSpeaking | BargeInCancelling, TranscriptionFailed { message }) => {
            log::warn!("User speech could not be transcribed: {}", message);
            session.transcription_failed = true;
            try_complete_turn(session, policy)
        }

        // -----------------
        // AiResponding
        // -----------------
        (AiResponding, SpeechStarted) => barge_in(session),
        (AiResponding, ResponseAudio(frame)) => {
            let Some(response) = session.response.as_mut().filter(|r| r.is_live()) else {
                return vec![];
            };
            response.state = ResponseState::Streaming;
            session.playback_active = true;
            session.stats.frames_played += 1;
            vec![Effect::PlayAudio(frame)]
        }
        (AiResponding, ResponseDone { response_id }) => {
            if !complete_response(session, response_id.as_deref()) {
                return vec![];
            }
            session.last_activity = Instant::now();
            session.transition(Idle);
            vec![Effect::FinishPlayback]
        }

        // -----------------
        // BargeInCancelling
        // -----------------
        (BargeInCancelling, CancelAcknowledged { .. }) => {
            log::debug!("Cancel acknowledged");
            session.close_open_response();
            finish_barge_in(session, policy)
        }
        (BargeInCancelling, CancelNotActive) => {
            log::debug!("Cancel race: response already finished, treating as no-op");
            session.close_open_response();
            finish_barge_in(session, policy)
        }
        (BargeInCancelling, ResponseDone { response_id }) => {
            // Finished naturally before the cancel landed: no ack will follow
            complete_response(session, response_id.as_deref());
            finish_barge_in(session, policy)
        }
        (BargeInCancelling, ResponseAudio(frame)) => {
            log::debug!("Dropping response audio during barge-in (seq={})", frame.sequence);
            vec![]
        }

        // -----------------
        // Any state
        // -----------------
        (_, ResponseStarted { response_id }) => {
            match session.response.as_mut() {
                Some(r) if r.state == ResponseState::Pending => {
                    log::debug!("Response {} started as {}", r.seq, response_id);
                    r.remote_id = Some(response_id);
                    r.state = ResponseState::Streaming;
                }
                _ => log::debug!("Ignoring unexpected response start {}", response_id),
            }
            vec![]
        }
        (_, Transcript(event)) => match event.speaker {
            Speaker::User => on_user_transcript(session, policy, event),
            Speaker::Assistant => {
                if let Some(r) = session.response.as_mut().filter(|r| r.is_live()) {
                    if event.is_final {
                        r.text.process_completed(&event.text);
                    } else {
                        r.text.process_delta(&event.text, false);
                    }
                }
                vec![]
            }
        },
        (_, ServiceError { code, message }) => {
            let detail = match code {
                Some(code) => format!("{} ({})", message, code),
                None => message,
            };
            protocol_fault(session, policy, detail)
        }
        (_, CancelAcknowledged { .. } | CancelNotActive) => {
            log::debug!("Late cancel acknowledgement ignored");
            vec![]
        }
        (state, other) => {
            log::debug!("Ignoring {:?} in {:?}", other, state);
            vec![]
        }
    }
}

fn on_user_transcript(
    session: &mut Session,
    policy: &TurnPolicy,
    event: TranscriptEvent,
) -> Vec<Effect> {
    if !event.is_final {
        let is_filler = policy.filler.is_filler(&event.text);
        session.user_text.process_delta(&event.text, is_filler);
        if is_filler {
            session.stats.fillers_suppressed += 1;
            log::debug!("Filler delta suppressed: {:?}", event.text);
        } else {
            session.last_activity = Instant::now();
        }
        return vec![];
    }

    let text = event.text.trim().to_string();
    // Lexicon-only text too long to count as filler is kept whole
    let kept = match policy.filler.strip_trailing(&text) {
        "" => text.as_str(),
        kept => kept,
    };
    session.user_text.process_completed(kept);

    if policy.filler.is_filler(&text) {
        session.stats.fillers_suppressed += 1;
        log::debug!("Filler-only utterance suppressed: {:?}", text);
        session.user_final = Some(UserFinal::Filler);
        return try_complete_turn(session, policy);
    }

    session.last_activity = Instant::now();

    if let Some(phrase) = policy.termination.detect(&text) {
        let phrase = phrase.to_string();
        let kept = session.user_text.current_text().to_string();
        session.append(Speaker::User, kept);
        session.termination = Some(TerminationSignal {
            phrase: phrase.clone(),
        });
        return terminate(
            session,
            Outcome::Completed,
            EndReason::PhraseMatched { phrase },
        );
    }

    match session.state {
        TurnState::UserSpeaking | TurnState::BargeInCancelling => {
            session.user_final = Some(UserFinal::Content);
            try_complete_turn(session, policy)
        }
        _ => {
            // Late final outside a tracked turn: keep it, no new response
            let kept = session.user_text.current_text().to_string();
            session.append(Speaker::User, kept);
            vec![]
        }
    }
}

/// Complete the user turn once both speech-stop and the final transcript
/// (or a transcription failure) are in.
fn try_complete_turn(session: &mut Session, policy: &TurnPolicy) -> Vec<Effect> {
    if session.state != TurnState::UserSpeaking || !session.speech_stopped {
        return vec![];
    }

    if session.transcription_failed {
        session.reset_user_turn();
        return start_response(
            session,
            policy,
            Some(policy.repeat_request_instructions.clone()),
        );
    }

    match session.user_final.take() {
        None => vec![],
        Some(UserFinal::Filler) => {
            session.reset_user_turn();
            session.transition(TurnState::Idle);
            vec![]
        }
        Some(UserFinal::Content) => {
            let text = session.user_text.current_text().to_string();
            session.append(Speaker::User, text);
            session.reset_user_turn();
            start_response(session, policy, None)
        }
    }
}

fn start_response(
    session: &mut Session,
    policy: &TurnPolicy,
    instructions: Option<String>,
) -> Vec<Effect> {
    if let Some(r) = session.response.as_ref().filter(|r| r.is_open()) {
        log::warn!("Response {} still open, not requesting another", r.seq);
        return vec![];
    }

    let seq = session.next_response_seq;
    session.next_response_seq += 1;
    session.transition(TurnState::AiResponding);

    let wait = session.last_response_end.map_or(Duration::ZERO, |end| {
        (end + policy.response_cooldown).saturating_duration_since(Instant::now())
    });
    if !wait.is_zero() {
        log::debug!("Response {} deferred for {:?}", seq, wait);
        session.response = Some(ResponseStream::new(
            seq,
            ResponseState::Deferred,
            instructions,
        ));
        return vec![Effect::ArmCooldownTimer { seq, after: wait }];
    }

    session.response = Some(ResponseStream::new(seq, ResponseState::Pending, None));
    request_response(session, policy, seq, instructions)
}

fn request_response(
    session: &mut Session,
    policy: &TurnPolicy,
    seq: u64,
    instructions: Option<String>,
) -> Vec<Effect> {
    session.stats.responses_requested += 1;
    vec![
        Effect::RequestResponse { seq, instructions },
        Effect::ArmResponseTimer {
            seq,
            after: policy.response_timeout,
        },
    ]
}

/// Mark the open response completed and record its text.
/// Returns false if there is no matching open response.
fn complete_response(session: &mut Session, response_id: Option<&str>) -> bool {
    let Some(response) = session.response.as_mut().filter(|r| r.is_live()) else {
        log::debug!("Ignoring response-done without an open response");
        return false;
    };

    if let (Some(done), Some(ours)) = (response_id, response.remote_id.as_deref()) {
        if done != ours {
            log::debug!("Ignoring response-done for stale response {}", done);
            return false;
        }
    }

    response.state = ResponseState::Completed;
    session.last_response_end = Some(Instant::now());
    let text = response.text().trim().to_string();
    if !text.is_empty() {
        session.append(Speaker::Assistant, text);
    }
    true
}

fn barge_in(session: &mut Session) -> Vec<Effect> {
    session.stats.barge_ins += 1;
    session.reset_user_turn();
    session.playback_active = false;

    match session.response.as_ref().filter(|r| r.is_open()) {
        Some(r) if r.state == ResponseState::Deferred => {
            // Never requested, so there is nothing to cancel remotely
            log::info!("Barge-in: dropping deferred response {}", r.seq);
            session.close_open_response();
            session.transition(TurnState::UserSpeaking);
            vec![Effect::FlushPlayback]
        }
        Some(r) => {
            log::info!("Barge-in: cancelling response {}", r.seq);
            let response_id = r.remote_id.clone();
            session.transition(TurnState::BargeInCancelling);
            vec![
                Effect::CancelResponse { response_id },
                Effect::FlushPlayback,
            ]
        }
        None => {
            // Already terminal: cancel would be a no-op
            session.transition(TurnState::UserSpeaking);
            vec![Effect::FlushPlayback]
        }
    }
}

fn finish_barge_in(session: &mut Session, policy: &TurnPolicy) -> Vec<Effect> {
    session.transition(TurnState::UserSpeaking);
    let mut effects = vec![Effect::FlushPlayback];
    effects.extend(try_complete_turn(session, policy));
    effects
}

/// The link dropped. A response in flight cannot finish on the old link,
/// so it is abandoned now and its stall timer goes stale.
fn on_connection_lost(session: &mut Session) -> Vec<Effect> {
    if !session.has_open_response() && !session.playback_active {
        return vec![];
    }
    session.close_open_response();
    session.playback_active = false;
    vec![Effect::FlushPlayback]
}

fn on_reconnected(session: &mut Session) -> Vec<Effect> {
    session.stats.reconnects += 1;
    log::info!(
        "Reconnected, resuming with {} utterance(s) kept",
        session.transcript.len()
    );

    session.close_open_response();
    session.reset_user_turn();
    session.playback_active = false;
    session.transition(TurnState::Idle);
    vec![Effect::FlushPlayback]
}

fn on_tick(session: &mut Session, policy: &TurnPolicy, now: Instant) -> Vec<Effect> {
    let elapsed = now.saturating_duration_since(session.started);
    if elapsed >= policy.max_session {
        log::info!("Session reached maximum duration after {:?}", elapsed);
        return terminate(session, Outcome::Completed, EndReason::MaxDuration);
    }

    if let Some(limit) = policy.idle_timeout {
        let idle = now.saturating_duration_since(session.last_activity);
        if session.state == TurnState::Idle && idle >= limit {
            log::info!("No user activity for {:?}, ending session", idle);
            return terminate(session, Outcome::Completed, EndReason::IdleTimeout);
        }
    }

    vec![]
}

fn protocol_fault(session: &mut Session, policy: &TurnPolicy, message: String) -> Vec<Effect> {
    session.stats.protocol_faults += 1;
    let faults = session.stats.protocol_faults;

    if faults > policy.max_protocol_faults as u64 {
        return fail(
            session,
            SessionError::Protocol(format!("{} faults, last: {}", faults, message)),
        );
    }

    log::warn!("Protocol fault {} skipped: {}", faults, message);
    vec![]
}

fn fail(session: &mut Session, error: SessionError) -> Vec<Effect> {
    terminate(session, Outcome::Failed, EndReason::Fatal { error })
}

fn terminate(session: &mut Session, outcome: Outcome, reason: EndReason) -> Vec<Effect> {
    match outcome {
        Outcome::Completed => log::info!("Session {} completed: {}", session.id, reason),
        Outcome::Failed => log::error!("Session {} failed: {}", session.id, reason),
    }

    session.close_open_response();
    session.playback_active = false;
    session.end = Some(SessionEnd { outcome, reason });
    session.transition(TurnState::Terminated);
    vec![Effect::FlushPlayback, Effect::CloseConnection]
}
