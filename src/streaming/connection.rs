//! Connection Manager
//!
//! Owns the transport to the speech service. A single pump task multiplexes
//! outbound control messages, captured audio frames and inbound events over
//! one `Link`, and supervises reconnects.
//!
//! # Connection Flow
//!
//! 1. `open()` - Connect (with retries), wait for `session.created`, send config
//! 2. `send()` - Queue a control message (FIFO, ahead of audio)
//! 3. Inbound events are decoded and forwarded to the controller channel
//! 4. `close()` - Stop the pump; every later `send()` fails with `Closed`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, InboundDecoder, ServerMessage, SessionConfig};
use super::ConnectionError;
use crate::audio::{AudioFrame, FrameQueue};
use crate::state_machine::Event;

/// One established transport session carrying JSON text messages
pub trait Link: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Next inbound text message; `None` once the peer has closed.
    /// Must be cancel-safe: it is raced against outbound work.
    fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub type BoxLink = Box<dyn Link>;

/// Opens new links to the speech service
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<BoxLink, ConnectionError>>;
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Consecutive connect attempts before giving up
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on the socket handshake and on waiting for `session.created`
    pub connect_timeout: Duration,
    /// Sent as `session.update` on every (re)connect
    pub session: SessionConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Backoff before attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Connect once and run the session handshake
pub async fn establish(
    connector: &dyn Connector,
    config: &ConnectionConfig,
) -> Result<BoxLink, ConnectionError> {
    let mut link = timeout(config.connect_timeout, connector.connect())
        .await
        .map_err(|_| ConnectionError::ConnectionFailed("Connection timeout".to_string()))??;

    log::info!("Connection: socket open, waiting for session.created...");

    let session_id = timeout(config.connect_timeout, async {
        loop {
            match link.next_text().await {
                Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::SessionCreated { session }) => return Ok(session.id),
                    Ok(ServerMessage::Error { error }) => {
                        return Err(ConnectionError::AuthenticationFailed(error.message));
                    }
                    Ok(_) => {
                        log::debug!("Connection: ignoring message while waiting for session.created");
                    }
                    Err(e) => {
                        log::warn!("Connection: failed to parse handshake message: {}", e);
                    }
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ConnectionError::Disconnected(
                        "Connection closed before session created".to_string(),
                    ))
                }
            }
        }
    })
    .await
    .map_err(|_| ConnectionError::ConnectionFailed("Session creation timeout".to_string()))??;

    log::info!("Connection: session created: {}", session_id);

    let update = serde_json::to_string(&ClientMessage::session_update(config.session.clone()))
        .map_err(|e| ConnectionError::ProtocolError(e.to_string()))?;
    link.send_text(update).await?;

    Ok(link)
}

/// Initial connect with the same bounded retry used for reconnects
async fn connect_with_retry(
    connector: &dyn Connector,
    config: &ConnectionConfig,
) -> Result<BoxLink, ConnectionError> {
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = backoff_delay(config.base_delay, attempt - 1, config.max_delay);
            log::info!(
                "Connection: retrying in {:?} (attempt {}/{})",
                delay,
                attempt,
                attempts
            );
            tokio::time::sleep(delay).await;
        }

        match establish(connector, config).await {
            Ok(link) => return Ok(link),
            Err(e) => {
                log::warn!("Connection: attempt {} failed: {}", attempt, e);
                last_error = Some(e);
            }
        }
    }

    Err(ConnectionError::RetriesExhausted {
        attempts,
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string()),
    })
}

/// Handle to the connection pump
pub struct ConnectionManager {
    control: mpsc::UnboundedSender<ClientMessage>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    frames_sent: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Connect and start pumping.
    ///
    /// Captured frames are drained from `frames`; decoded inbound events and
    /// reconnect notifications go to `events`.
    pub async fn open(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        frames: Arc<FrameQueue>,
        events: mpsc::Sender<Event>,
    ) -> Result<Self, ConnectionError> {
        let link = connect_with_retry(connector.as_ref(), &config).await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let frames_sent = Arc::new(AtomicU64::new(0));

        let pump = Pump {
            connector,
            config,
            frames,
            events,
            control: control_rx,
            cancel: cancel.clone(),
            closed: closed.clone(),
            decoder: InboundDecoder::new(),
            frames_sent: frames_sent.clone(),
        };
        let handle = tokio::spawn(pump.run(link));

        Ok(Self {
            control: control_tx,
            closed,
            cancel,
            pump: Mutex::new(Some(handle)),
            frames_sent,
        })
    }

    /// Queue a control message for the service
    pub fn send(&self, msg: ClientMessage) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        self.control.send(msg).map_err(|_| ConnectionError::Closed)
    }

    /// Stop the pump and close the link. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("Connection: closing");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the pump task to finish
    pub async fn wait_closed(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Connection: pump task failed: {}", e);
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Pump {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    frames: Arc<FrameQueue>,
    events: mpsc::Sender<Event>,
    control: mpsc::UnboundedReceiver<ClientMessage>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    decoder: InboundDecoder,
    frames_sent: Arc<AtomicU64>,
}

enum Step {
    Cancelled,
    Control(Option<ClientMessage>),
    Inbound(Option<Result<String, ConnectionError>>),
    Audio(Option<AudioFrame>),
}

impl Pump {
    async fn run(mut self, mut link: BoxLink) {
        let mut audio_open = true;

        loop {
            // Control first so a cancel never waits behind queued audio
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                msg = self.control.recv() => Step::Control(msg),
                inbound = link.next_text() => Step::Inbound(inbound),
                frame = self.frames.pop(), if audio_open => Step::Audio(frame),
            };

            let result = match step {
                Step::Cancelled | Step::Control(None) => {
                    link.close().await;
                    break;
                }
                Step::Control(Some(msg)) => {
                    log::debug!("Connection: sending {}", msg.kind());
                    write(&mut link, &msg).await
                }
                Step::Audio(None) => {
                    log::debug!("Connection: capture queue closed");
                    audio_open = false;
                    Ok(())
                }
                Step::Audio(Some(frame)) => {
                    let result = write(&mut link, &ClientMessage::audio_append(&frame.samples)).await;
                    if result.is_ok() {
                        let sent = self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                        if sent % 100 == 0 {
                            log::debug!("Connection: {} audio frames sent", sent);
                        }
                    }
                    result
                }
                Step::Inbound(Some(Ok(text))) => {
                    self.dispatch(&text).await;
                    Ok(())
                }
                Step::Inbound(Some(Err(e))) => Err(e),
                Step::Inbound(None) => Err(ConnectionError::Disconnected(
                    "Connection closed by server".to_string(),
                )),
            };

            if let Err(e) = result {
                if self.cancel.is_cancelled() {
                    break;
                }
                log::warn!("Connection: dropped: {}", e);
                match self.reconnect(e).await {
                    Some(next) => link = next,
                    None => break,
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        log::info!("Connection: pump stopped");
    }

    async fn dispatch(&mut self, text: &str) {
        let event = match self.decoder.decode(text) {
            Ok(Some(service)) => Event::Service(service),
            Ok(None) => return,
            Err(fault) => {
                log::warn!("Connection: skipping bad inbound event: {}", fault);
                Event::ProtocolFault(fault)
            }
        };
        if self.events.send(event).await.is_err() {
            log::debug!("Connection: controller gone, dropping inbound event");
        }
    }

    /// Reconnect with bounded backoff. `None` means give up or cancelled.
    async fn reconnect(&mut self, cause: ConnectionError) -> Option<BoxLink> {
        let max_attempts = self.config.max_attempts;
        let mut last = cause.to_string();

        for attempt in 1..=max_attempts {
            let _ = self
                .events
                .send(Event::Reconnecting {
                    attempt,
                    max_attempts,
                })
                .await;

            let delay = backoff_delay(self.config.base_delay, attempt, self.config.max_delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = establish(self.connector.as_ref(), &self.config) => result,
            };

            match result {
                Ok(link) => {
                    // Anything queued for the dead session is stale
                    let mut stale = 0;
                    while self.control.try_recv().is_ok() {
                        stale += 1;
                    }
                    self.frames.clear();
                    log::info!(
                        "Connection: reconnected on attempt {} ({} stale message(s) dropped)",
                        attempt,
                        stale
                    );
                    let _ = self.events.send(Event::Reconnected).await;
                    return Some(link);
                }
                Err(e) => {
                    log::warn!("Connection: reconnect attempt {} failed: {}", attempt, e);
                    last = e.to_string();
                }
            }
        }

        log::error!(
            "Connection: giving up after {} reconnect attempts",
            max_attempts
        );
        let _ = self
            .events
            .send(Event::TransportFailed(ConnectionError::RetriesExhausted {
                attempts: max_attempts,
                last,
            }))
            .await;
        None
    }
}

async fn write(link: &mut BoxLink, msg: &ClientMessage) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ProtocolError(e.to_string()))?;
    link.send_text(json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ServiceEvent;
    use std::collections::VecDeque;

    const SESSION_CREATED: &str = r#"{"type":"session.created","session":{"id":"sess_1"}}"#;

    struct MockLink {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    impl Link for MockLink {
        fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
            let result = self
                .outbound
                .send(text)
                .map_err(|e| ConnectionError::SendFailed(e.to_string()));
            Box::pin(async move { result })
        }

        fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>> {
            Box::pin(async move { self.inbound.recv().await.map(Ok) })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    /// Server side of one accepted mock connection
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    struct MockConnector {
        /// true = accept, false = refuse; empty = refuse
        plan: Mutex<VecDeque<bool>>,
        accepted: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MockConnector {
        fn new(plan: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                plan: Mutex::new(plan.iter().copied().collect()),
                accepted: tx,
            });
            (connector, rx)
        }
    }

    impl Connector for MockConnector {
        fn connect(&self) -> BoxFuture<'_, Result<BoxLink, ConnectionError>> {
            let accept = self.plan.lock().unwrap().pop_front().unwrap_or(false);
            Box::pin(async move {
                if !accept {
                    return Err(ConnectionError::ConnectionFailed("refused".into()));
                }
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                to_client.send(SESSION_CREATED.to_string()).unwrap();
                let _ = self.accepted.send(ServerEnd {
                    to_client,
                    from_client,
                });
                Ok(Box::new(MockLink { inbound, outbound }) as BoxLink)
            })
        }
    }

    fn config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(1),
            session: SessionConfig::default(),
        }
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn open(
        plan: &[bool],
        max_attempts: u32,
    ) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<ServerEnd>,
        mpsc::Receiver<Event>,
        Arc<FrameQueue>,
    ) {
        let (connector, accepted) = MockConnector::new(plan);
        let (events_tx, events_rx) = mpsc::channel(64);
        let frames = Arc::new(FrameQueue::new(8));
        let manager = ConnectionManager::open(connector, config(max_attempts), frames.clone(), events_tx)
            .await
            .expect("open failed");
        (manager, accepted, events_rx, frames)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 10, max), max);
    }

    #[tokio::test]
    async fn test_open_sends_session_update() {
        let (_manager, mut accepted, _events, _frames) = open(&[true], 3).await;
        let mut server = recv(&mut accepted).await;

        let first = recv(&mut server.from_client).await;
        assert!(first.contains("\"type\":\"session.update\""));
    }

    #[tokio::test]
    async fn test_open_retries_then_succeeds() {
        let (_manager, mut accepted, _events, _frames) = open(&[false, false, true], 3).await;
        assert!(recv(&mut accepted).await.to_client.send(String::new()).is_ok());
    }

    #[tokio::test]
    async fn test_open_gives_up_after_max_attempts() {
        let (connector, _accepted) = MockConnector::new(&[false, false, true]);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let result = ConnectionManager::open(
            connector,
            config(2),
            Arc::new(FrameQueue::new(4)),
            events_tx,
        )
        .await;

        match result {
            Err(ConnectionError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.contains("refused"));
            }
            Err(other) => panic!("Expected RetriesExhausted, got {:?}", other),
            Ok(_) => panic!("Expected open to fail"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (manager, _accepted, _events, _frames) = open(&[true], 3).await;
        assert!(manager.send(ClientMessage::response_create(None)).is_ok());

        manager.close();
        manager.close();
        assert_eq!(
            manager.send(ClientMessage::response_create(None)),
            Err(ConnectionError::Closed)
        );
        manager.wait_closed().await;
        assert!(manager.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_and_audio_are_forwarded() {
        let (manager, mut accepted, _events, frames) = open(&[true], 3).await;
        let mut server = recv(&mut accepted).await;
        recv(&mut server.from_client).await; // session.update

        manager
            .send(ClientMessage::response_cancel(Some("resp_1".into())))
            .unwrap();
        let cancel = recv(&mut server.from_client).await;
        assert!(cancel.contains("response.cancel"));

        frames.push(vec![0; 240]);
        let append = recv(&mut server.from_client).await;
        assert!(append.contains("input_audio_buffer.append"));

        // frames_sent is bumped after the write completes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_inbound_events_are_decoded() {
        let (_manager, mut accepted, mut events, _frames) = open(&[true], 3).await;
        let server = recv(&mut accepted).await;

        server
            .to_client
            .send(r#"{"type":"input_audio_buffer.speech_started"}"#.into())
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            Event::Service(ServiceEvent::SpeechStarted)
        ));

        server.to_client.send("{broken".into()).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            Event::ProtocolFault(_)
        ));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let (manager, mut accepted, mut events, _frames) = open(&[true, false, false, true], 3).await;
        let first = recv(&mut accepted).await;
        drop(first);

        assert!(matches!(
            next_event(&mut events).await,
            Event::Reconnecting { attempt: 1, max_attempts: 3 }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            Event::Reconnecting { attempt: 2, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            Event::Reconnecting { attempt: 3, .. }
        ));
        assert!(matches!(next_event(&mut events).await, Event::Reconnected));

        let mut second = recv(&mut accepted).await;
        assert!(recv(&mut second.from_client)
            .await
            .contains("session.update"));
        assert!(manager.send(ClientMessage::response_create(None)).is_ok());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_is_reported() {
        let (manager, mut accepted, mut events, _frames) = open(&[true, false, false], 2).await;
        drop(recv(&mut accepted).await);

        let mut failed = None;
        while failed.is_none() {
            if let Event::TransportFailed(err) = next_event(&mut events).await {
                failed = Some(err);
            }
        }
        assert!(matches!(
            failed,
            Some(ConnectionError::RetriesExhausted { attempts: 2, .. })
        ));

        manager.wait_closed().await;
        assert_eq!(
            manager.send(ClientMessage::response_create(None)),
            Err(ConnectionError::Closed)
        );
    }
}
