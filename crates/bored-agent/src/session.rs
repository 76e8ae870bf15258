//! The control channel to the broker
//!
//! A [`BrokerSession`] owns exactly one channel at a time. Each successful
//! connect starts a *generation*: a writer task that owns the socket sink, a
//! read loop that answers keepalives and hands every other frame to the
//! [`FrameHandler`], and a cancellation token the handler scopes its own
//! tasks to. When the channel fails the generation is torn down completely
//! before the next connect attempt.

use crate::config::{ConfigError, SessionConfig};
use async_trait::async_trait;
use bored_cert::KeyPair;
use bored_proto::Frame;
use bored_transport::{ChannelConnector, ConnectionError, ControlChannel, FrameSink};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Shut down by `disconnect()`
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Resources of one session generation
///
/// Handlers must not keep clones of `outbound` beyond the tasks they spawn
/// for the generation; the socket writer stops once every sender is gone.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub generation: u64,
    pub outbound: mpsc::Sender<Frame>,
    /// Cancelled when the generation ends
    pub cancel: CancellationToken,
}

/// Receives the frames of each generation
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn generation_started(&self, ctx: &GenerationContext);

    /// Called from the read loop; must not wait on a single stream
    async fn handle_frame(&self, ctx: &GenerationContext, frame: Frame);

    /// Called after `ctx.cancel` fired; returns once the generation's tasks are done
    async fn generation_ended(&self, ctx: &GenerationContext);
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

enum GenerationEnd {
    Cancelled,
    Failed(String),
}

struct Lifecycle {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn ChannelConnector>,
    handler: Arc<dyn FrameHandler>,
    identity: KeyPair,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
}

/// The agent's connection to the broker
pub struct BrokerSession {
    inner: Arc<SessionInner>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl BrokerSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn ChannelConnector>,
        handler: Arc<dyn FrameHandler>,
        identity: KeyPair,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                handler,
                identity,
                state,
                generation: AtomicU64::new(0),
                last_error: std::sync::Mutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Number of connect attempts made so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Establish the control channel and start the session supervisor
    ///
    /// A no-op while the session is already running. Failures of this first
    /// attempt are returned; once connected, failures only feed reconnection.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!(state = %self.state(), "Session already running");
            return Ok(());
        }

        self.inner.set_state(SessionState::Connecting);
        let generation = self.inner.next_generation();
        info!(generation, "Connecting to broker");

        match self.inner.dial().await {
            Ok(channel) => {
                info!(generation, peer = channel.peer(), "Connected to broker");
                self.inner.clear_error();
                self.inner.set_state(SessionState::Connected);

                let cancel = CancellationToken::new();
                let supervisor = tokio::spawn(supervise(
                    self.inner.clone(),
                    channel,
                    generation,
                    cancel.clone(),
                ));
                *lifecycle = Some(Lifecycle { cancel, supervisor });
                Ok(())
            }
            Err(e) => {
                warn!(generation, error = %e, "Failed to connect to broker");
                self.inner.record_error(&e);
                self.inner.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close every stream and the channel, then mark the session closed
    ///
    /// Idempotent; a no-op when the session never connected.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(Lifecycle { cancel, supervisor }) = lifecycle.take() else {
            debug!(state = %self.state(), "Session not running");
            return;
        };

        info!(generation = self.generation(), "Disconnecting from broker");
        cancel.cancel();
        if let Err(e) = supervisor.await {
            warn!(error = %e, "Session supervisor failed");
        }

        self.inner.set_state(SessionState::Closed);
        info!("Disconnected from broker");
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn record_error(&self, error: &dyn fmt::Display) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    fn clear_error(&self) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = None;
        }
    }

    async fn dial(&self) -> Result<ControlChannel, ConnectionError> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.connector.connect(&self.identity)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::NetworkUnreachable(format!(
                "connect timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Retry with backoff until connected or cancelled
    async fn reconnect(
        &self,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Option<(ControlChannel, u64)> {
        loop {
            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to broker");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let generation = self.next_generation();
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.dial() => result,
            };

            match result {
                Ok(channel) => {
                    backoff.reset();
                    self.clear_error();
                    self.set_state(SessionState::Connected);
                    info!(generation, peer = channel.peer(), "Reconnected to broker");
                    return Some((channel, generation));
                }
                Err(e) => {
                    warn!(generation, error = %e, "Reconnect attempt failed");
                    self.record_error(&e);
                }
            }
        }
    }

    /// Run one generation to completion and tear it down
    async fn run_generation(
        &self,
        channel: ControlChannel,
        generation: u64,
        lifecycle: &CancellationToken,
    ) -> GenerationEnd {
        let (sink, mut stream) = channel.into_parts();
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let write_failed = CancellationToken::new();
        let mut writer = tokio::spawn(write_frames(
            sink,
            outbound_rx,
            generation,
            write_failed.clone(),
        ));

        let ctx = GenerationContext {
            generation,
            outbound,
            cancel: lifecycle.child_token(),
        };
        self.handler.generation_started(&ctx).await;

        let interval = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong: Option<(u64, Instant)> = None;

        let end = loop {
            let pong_deadline = awaiting_pong.map(|(_, deadline)| deadline);

            tokio::select! {
                _ = ctx.cancel.cancelled() => break GenerationEnd::Cancelled,
                _ = write_failed.cancelled() => {
                    break GenerationEnd::Failed("control channel write failed".to_string());
                }
                _ = keepalive.tick(), if awaiting_pong.is_none() => {
                    let nonce = rand::random::<u64>();
                    trace!(generation, nonce, "Sending keepalive ping");
                    if ctx.outbound.send(Frame::Ping { nonce }).await.is_err() {
                        break GenerationEnd::Failed("control channel writer stopped".to_string());
                    }
                    awaiting_pong = Some((nonce, Instant::now() + self.config.keepalive_timeout));
                }
                _ = sleep_until(pong_deadline) => {
                    break GenerationEnd::Failed(format!(
                        "no pong within {:?}",
                        self.config.keepalive_timeout
                    ));
                }
                item = stream.next() => match item {
                    Some(Ok(Frame::Ping { nonce })) => {
                        if ctx.outbound.send(Frame::Pong { nonce }).await.is_err() {
                            break GenerationEnd::Failed("control channel writer stopped".to_string());
                        }
                    }
                    Some(Ok(Frame::Pong { nonce })) => match awaiting_pong {
                        Some((expected, _)) if expected == nonce => {
                            trace!(generation, nonce, "Keepalive acknowledged");
                            awaiting_pong = None;
                        }
                        _ => debug!(generation, nonce, "Ignoring unexpected pong"),
                    },
                    Some(Ok(frame)) => self.handler.handle_frame(&ctx, frame).await,
                    Some(Err(e)) => break GenerationEnd::Failed(e.to_string()),
                    None => break GenerationEnd::Failed("closed by broker".to_string()),
                },
            }
        };

        ctx.cancel.cancel();
        self.handler.generation_ended(&ctx).await;
        drop(ctx);

        // The writer drains the close frames of the relays, then closes the sink
        if tokio::time::timeout(self.config.drain_timeout, &mut writer)
            .await
            .is_err()
        {
            warn!(generation, "Control channel writer did not finish, aborting");
            writer.abort();
        }

        info!(generation, "Session generation ended");
        end
    }
}

async fn supervise(
    inner: Arc<SessionInner>,
    mut channel: ControlChannel,
    mut generation: u64,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(
        inner.config.reconnect_delay,
        inner.config.max_reconnect_delay,
    );

    loop {
        match inner.run_generation(channel, generation, &cancel).await {
            GenerationEnd::Cancelled => return,
            GenerationEnd::Failed(reason) => {
                warn!(generation, %reason, "Control channel lost");
                inner.record_error(&reason);
                inner.set_state(SessionState::Reconnecting);
            }
        }

        match inner.reconnect(&mut backoff, &cancel).await {
            Some((next, next_generation)) => {
                channel = next;
                generation = next_generation;
            }
            None => return,
        }
    }
}

/// Own the sink; batch whatever is queued before flushing
async fn write_frames(
    mut sink: FrameSink,
    mut frames: mpsc::Receiver<Frame>,
    generation: u64,
    failed: CancellationToken,
) {
    while let Some(frame) = frames.recv().await {
        let mut result = sink.feed(frame).await;
        while result.is_ok() {
            match frames.try_recv() {
                Ok(frame) => result = sink.feed(frame).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = sink.flush().await;
        }

        if let Err(e) = result {
            debug!(generation, error = %e, "Control channel write failed");
            failed.cancel();
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(generation, error = %e, "Failed to close control channel");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bored_proto::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    type BrokerEnd = Framed<DuplexStream, FrameCodec>;

    struct FakeConnector {
        failures: std::sync::Mutex<VecDeque<ConnectionError>>,
        accepted: mpsc::UnboundedSender<BrokerEnd>,
    }

    #[async_trait]
    impl ChannelConnector for FakeConnector {
        async fn connect(&self, _identity: &KeyPair) -> Result<ControlChannel, ConnectionError> {
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            let (agent, broker) = tokio::io::duplex(64 * 1024);
            let _ = self
                .accepted
                .send(Framed::new(broker, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)));
            Ok(ControlChannel::from_io(agent, DEFAULT_MAX_FRAME_SIZE, "fake"))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        frames: Mutex<Vec<(u64, Frame)>>,
        started: Mutex<Vec<u64>>,
        ended: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl FrameHandler for RecordingHandler {
        async fn generation_started(&self, ctx: &GenerationContext) {
            self.started.lock().await.push(ctx.generation);
        }

        async fn handle_frame(&self, ctx: &GenerationContext, frame: Frame) {
            self.frames.lock().await.push((ctx.generation, frame));
        }

        async fn generation_ended(&self, ctx: &GenerationContext) {
            self.ended.lock().await.push(ctx.generation);
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(1),
            outbound_queue: 16,
        }
    }

    fn session(
        config: SessionConfig,
        failures: Vec<ConnectionError>,
    ) -> (
        BrokerSession,
        Arc<RecordingHandler>,
        Arc<FakeConnector>,
        mpsc::UnboundedReceiver<BrokerEnd>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            failures: std::sync::Mutex::new(failures.into()),
            accepted: tx,
        });
        let handler = Arc::new(RecordingHandler::default());
        let identity = bored_cert::generate_keypair("team-a", None).unwrap();
        (
            BrokerSession::new(config, connector.clone(), handler.clone(), identity).unwrap(),
            handler,
            connector,
            rx,
        )
    }

    async fn wait_for_state(session: &BrokerSession, state: SessionState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_timings_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            failures: std::sync::Mutex::new(VecDeque::new()),
            accepted: tx,
        });
        let identity = bored_cert::generate_keypair("team-a", None).unwrap();

        let mut keepalive = test_config();
        keepalive.keepalive_interval = Duration::ZERO;
        let mut backoff = test_config();
        backoff.reconnect_delay = Duration::ZERO;

        for config in [keepalive, backoff] {
            let result = BrokerSession::new(
                config,
                connector.clone(),
                Arc::new(RecordingHandler::default()),
                identity.clone(),
            );
            assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        }
    }

    #[tokio::test]
    async fn test_initial_unauthorized_is_returned() {
        let (session, _handler, _connector, _brokers) = session(
            test_config(),
            vec![ConnectionError::Unauthorized("401".to_string())],
        );

        let result = session.connect().await;
        assert!(matches!(result, Err(ConnectionError::Unauthorized(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.generation(), 1);
        assert!(session.last_error().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_frames_reach_handler_and_pings_are_answered() {
        let (session, handler, _connector, mut brokers) = session(test_config(), vec![]);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        let mut broker = brokers.recv().await.unwrap();

        broker.send(Frame::Ping { nonce: 77 }).await.unwrap();
        assert_eq!(broker.next().await.unwrap().unwrap(), Frame::Pong { nonce: 77 });

        broker.send(Frame::close(3, "bye")).await.unwrap();
        // Round trip another ping so the close has been dispatched
        broker.send(Frame::Ping { nonce: 78 }).await.unwrap();
        broker.next().await.unwrap().unwrap();

        let frames = handler.frames.lock().await.clone();
        assert_eq!(frames, vec![(1, Frame::close(3, "bye"))]);
        assert_eq!(*handler.started.lock().await, vec![1]);

        session.disconnect().await;
        assert_eq!(*handler.ended.lock().await, vec![1]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, _handler, _connector, mut brokers) = session(test_config(), vec![]);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().await.unwrap();
        let mut broker = brokers.recv().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);

        // The broker sees the channel end
        assert!(broker.next().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let (session, _handler, _connector, mut brokers) = session(test_config(), vec![]);

        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.generation(), 1);
        assert!(brokers.recv().await.is_some());
        assert!(brokers.try_recv().is_err());

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_channel_loss() {
        let (session, handler, _connector, mut brokers) = session(test_config(), vec![]);
        session.connect().await.unwrap();
        let broker = brokers.recv().await.unwrap();

        drop(broker);
        let _second = brokers.recv().await.unwrap();
        wait_for_state(&session, SessionState::Connected).await;

        assert_eq!(session.generation(), 2);
        assert_eq!(*handler.ended.lock().await, vec![1]);
        for _ in 0..100 {
            if handler.started.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*handler.started.lock().await, vec![1, 2]);

        session.disconnect().await;
        assert_eq!(*handler.ended.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unauthorized_during_reconnect_is_retried() {
        let (session, _handler, connector, mut brokers) = session(test_config(), vec![]);
        session.connect().await.unwrap();
        let broker = brokers.recv().await.unwrap();

        connector.failures.lock().unwrap().extend([
            ConnectionError::Unauthorized("401".to_string()),
            ConnectionError::NetworkUnreachable("down".to_string()),
        ]);
        drop(broker);

        let _fourth = tokio::time::timeout(Duration::from_secs(5), brokers.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_state(&session, SessionState::Connected).await;
        assert_eq!(session.generation(), 4);
        assert!(session.last_error().is_none());

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect_loop() {
        let mut config = test_config();
        config.reconnect_delay = Duration::from_secs(30);
        config.max_reconnect_delay = Duration::from_secs(30);
        let (session, _handler, _connector, mut brokers) = session(config, vec![]);
        session.connect().await.unwrap();
        drop(brokers.recv().await.unwrap());

        wait_for_state(&session, SessionState::Reconnecting).await;
        tokio::time::timeout(Duration::from_secs(2), session.disconnect())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_keepalive_timeout_triggers_reconnect() {
        let mut config = test_config();
        config.keepalive_interval = Duration::from_millis(50);
        config.keepalive_timeout = Duration::from_millis(100);
        let (session, _handler, _connector, mut brokers) = session(config, vec![]);

        session.connect().await.unwrap();
        let mut silent = brokers.recv().await.unwrap();

        // The broker reads the ping but never answers
        assert!(matches!(
            silent.next().await.unwrap().unwrap(),
            Frame::Ping { .. }
        ));

        let _next = tokio::time::timeout(Duration::from_secs(5), brokers.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(session.generation() >= 2);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_keepalive_answered_keeps_generation() {
        let mut config = test_config();
        config.keepalive_interval = Duration::from_millis(30);
        config.keepalive_timeout = Duration::from_millis(100);
        let (session, _handler, _connector, mut brokers) = session(config, vec![]);

        session.connect().await.unwrap();
        let mut broker = brokers.recv().await.unwrap();

        for _ in 0..5 {
            match broker.next().await.unwrap().unwrap() {
                Frame::Ping { nonce } => broker.send(Frame::Pong { nonce }).await.unwrap(),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        assert_eq!(session.generation(), 1);
        assert_eq!(session.state(), SessionState::Connected);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_channel() {
        let mut config = test_config();
        config.reconnect_delay = Duration::from_millis(10);
        let (tx, mut brokers) = mpsc::unbounded_channel();

        struct SmallFrames(mpsc::UnboundedSender<BrokerEnd>);

        #[async_trait]
        impl ChannelConnector for SmallFrames {
            async fn connect(&self, _identity: &KeyPair) -> Result<ControlChannel, ConnectionError> {
                let (agent, broker) = tokio::io::duplex(64 * 1024);
                let _ = self
                    .0
                    .send(Framed::new(broker, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)));
                Ok(ControlChannel::from_io(agent, 1024, "fake"))
            }
        }

        let handler = Arc::new(RecordingHandler::default());
        let session = BrokerSession::new(
            config,
            Arc::new(SmallFrames(tx)),
            handler.clone(),
            bored_cert::generate_keypair("team-a", None).unwrap(),
        )
        .unwrap();
        session.connect().await.unwrap();
        let mut broker = brokers.recv().await.unwrap();

        broker.send(Frame::data(1, vec![0u8; 4096])).await.unwrap();

        let _second = tokio::time::timeout(Duration::from_secs(5), brokers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.generation(), 2);
        assert!(handler.frames.lock().await.is_empty());

        session.disconnect().await;
    }
}
