//! Controller loop
//!
//! Single owner of the `Session`: receives events, runs the reducer and hands
//! effects to the runner. Everything else talks to the session through the
//! event channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::effects::EffectRunner;
use crate::state_machine::{reduce, Event, Session, TurnPolicy};

/// Drive `session` until it terminates.
///
/// Cancelling `stop` is delivered to the reducer as `Event::Stop`. If every
/// event sender is dropped the session is stopped the same way.
pub async fn run_controller(
    mut session: Session,
    policy: TurnPolicy,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    stop: CancellationToken,
) -> Session {
    log::info!("Controller started for session {}", session.id);
    let mut stop_delivered = false;

    while !session.is_terminated() {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled(), if !stop_delivered => {
                stop_delivered = true;
                log::info!("Stop requested");
                Event::Stop
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    log::warn!("Event channel closed, stopping session");
                    Event::Stop
                }
            },
        };

        if !matches!(event, Event::Tick { .. }) {
            log::debug!("Received event: {:?}", event);
        }

        for effect in reduce(&mut session, &policy, event) {
            effect_runner.spawn(effect, tx.clone());
        }
    }

    log::info!(
        "Controller ended for session {}: {:?}",
        session.id,
        session.end()
    );
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{FillerClassifier, MatchMode, TerminationDetector};
    use crate::state_machine::{
        EndReason, Effect, Outcome, ServiceEvent, Speaker, TranscriptEvent, TurnState,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingRunner {
        effects: Mutex<Vec<Effect>>,
    }

    impl EffectRunner for RecordingRunner {
        fn spawn(&self, effect: Effect, _tx: mpsc::Sender<Event>) {
            self.effects.lock().unwrap().push(effect);
        }
    }

    fn policy() -> TurnPolicy {
        TurnPolicy {
            filler: FillerClassifier::new(&["うん", "はい"], 3),
            termination: TerminationDetector::new(&["さようなら"], MatchMode::Contains),
            response_timeout: Duration::from_secs(10),
            response_cooldown: Duration::ZERO,
            max_protocol_faults: 3,
            max_session: Duration::from_secs(300),
            idle_timeout: None,
            repeat_request_instructions: "もう一度お願いします".to_string(),
        }
    }

    fn user_final(text: &str) -> Event {
        Event::Service(ServiceEvent::Transcript(TranscriptEvent::final_text(
            Speaker::User,
            text,
        )))
    }

    #[tokio::test]
    async fn test_stop_token_ends_idle_session_as_completed() {
        let (tx, rx) = mpsc::channel(8);
        let runner = Arc::new(RecordingRunner::default());
        let stop = CancellationToken::new();
        stop.cancel();

        let session = run_controller(
            Session::new(Uuid::new_v4(), Instant::now()),
            policy(),
            rx,
            tx,
            runner.clone(),
            stop,
        )
        .await;

        let end = session.end().unwrap();
        assert_eq!(end.outcome, Outcome::Completed);
        assert_eq!(end.reason, EndReason::Cancelled);
        assert!(matches!(
            runner.effects.lock().unwrap().last(),
            Some(Effect::CloseConnection)
        ));
    }

    #[tokio::test]
    async fn test_events_drive_turn_then_termination_phrase() {
        let (tx, rx) = mpsc::channel(16);
        let runner = Arc::new(RecordingRunner::default());

        tx.send(Event::Service(ServiceEvent::SpeechStarted))
            .await
            .unwrap();
        tx.send(Event::Service(ServiceEvent::SpeechStopped))
            .await
            .unwrap();
        tx.send(user_final("それでは、さようなら")).await.unwrap();

        let session = run_controller(
            Session::new(Uuid::new_v4(), Instant::now()),
            policy(),
            rx,
            tx.clone(),
            runner,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(session.state(), TurnState::Terminated);
        let end = session.end().unwrap();
        assert_eq!(end.outcome, Outcome::Completed);
        assert_eq!(
            end.reason,
            EndReason::PhraseMatched {
                phrase: "さようなら".to_string()
            }
        );
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_turn_requests_response() {
        let (tx, rx) = mpsc::channel(16);
        let runner = Arc::new(RecordingRunner::default());
        let stop = CancellationToken::new();

        tx.send(Event::Service(ServiceEvent::SpeechStarted))
            .await
            .unwrap();
        tx.send(Event::Service(ServiceEvent::SpeechStopped))
            .await
            .unwrap();
        tx.send(user_final("今日は散歩に行きました")).await.unwrap();

        let handle = tokio::spawn(run_controller(
            Session::new(Uuid::new_v4(), Instant::now()),
            policy(),
            rx,
            tx.clone(),
            runner.clone(),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        let session = handle.await.unwrap();

        let effects = runner.effects.lock().unwrap();
        assert!(matches!(
            effects.first(),
            Some(Effect::RequestResponse { seq: 0, instructions: None })
        ));
        // Stopped while a response was open
        assert_eq!(session.end().unwrap().outcome, Outcome::Failed);
        assert_eq!(session.stats.responses_requested, 1);
    }
}
