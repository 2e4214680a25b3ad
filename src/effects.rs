//! Effect runner for the voice session
//!
//! Executes effects produced by the turn reducer against the service
//! connection and the playback sink. Effects never block the controller:
//! sends are queued, timers are spawned, and completions come back as events.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::audio::AudioSink;
use crate::state_machine::{Effect, Event};
use crate::streaming::{ClientMessage, ConnectionError, ConnectionManager};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Outbound half of the service connection as seen by effects
pub trait ServiceControl: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), ConnectionError>;
    fn close(&self);
}

impl ServiceControl for ConnectionManager {
    fn send(&self, msg: ClientMessage) -> Result<(), ConnectionError> {
        ConnectionManager::send(self, msg)
    }

    fn close(&self) {
        ConnectionManager::close(self)
    }
}

pub struct SessionEffectRunner {
    control: Arc<dyn ServiceControl>,
    sink: Arc<dyn AudioSink>,
}

impl SessionEffectRunner {
    pub fn new(control: Arc<dyn ServiceControl>, sink: Arc<dyn AudioSink>) -> Arc<Self> {
        Arc::new(Self { control, sink })
    }

    fn send(&self, msg: ClientMessage) {
        let kind = msg.kind();
        if let Err(e) = self.control.send(msg) {
            // The pump reports transport loss separately
            log::warn!("Effect: failed to queue {}: {}", kind, e);
        }
    }
}

impl EffectRunner for SessionEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::RequestResponse { seq, instructions } => {
                log::info!("Requesting response #{}", seq);
                self.send(ClientMessage::response_create(instructions));
            }

            Effect::CancelResponse { response_id } => {
                log::info!("Cancelling response {:?}", response_id);
                self.send(ClientMessage::response_cancel(response_id));
            }

            Effect::ArmResponseTimer { seq, after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Event::ResponseTimeout { seq }).await;
                });
            }

            Effect::ArmCooldownTimer { seq, after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Event::CooldownElapsed { seq }).await;
                });
            }

            Effect::PlayAudio(frame) => {
                if let Err(e) = self.sink.enqueue(frame) {
                    log::warn!("Playback rejected frame: {}", e);
                    if tx.try_send(Event::ProtocolFault(e.to_string())).is_err() {
                        log::warn!("Event channel full, protocol fault not reported");
                    }
                }
            }

            Effect::FinishPlayback => self.sink.end_of_stream(),

            Effect::FlushPlayback => self.sink.flush(),

            Effect::CloseConnection => self.control.close(),
        }
    }
}
