//! Agent orchestrator
//!
//! [`AgentProxy`] owns the [`BrokerSession`] and the stream dispatcher that
//! turns `Open` frames into relays. Every relay is spawned on the tracker of
//! the generation that opened it, so ending a generation (reconnect or
//! shutdown) closes every local socket it created.

use crate::config::AgentOptions;
use crate::policy::DestinationPolicy;
use crate::registry::{Inbound, StreamInfo, StreamRegistry, StreamShared};
use crate::relay::StreamRelay;
use crate::session::{Backoff, BrokerSession, FrameHandler, GenerationContext, SessionState};
use crate::AgentError;
use async_trait::async_trait;
use bored_cert::KeyPair;
use bored_proto::{Frame, StreamError, StreamErrorCode, StreamId, StreamTransport};
use bored_transport::{ChannelConnector, ConnectionError, LocalConnector};
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Routes stream frames to relays
pub(crate) struct StreamDispatcher {
    local_connector: Arc<dyn LocalConnector>,
    policy: Arc<dyn DestinationPolicy>,
    registry: StreamRegistry,
    /// Relay tasks of the current generation
    tracker: Mutex<Option<TaskTracker>>,
    window: u32,
    read_chunk_size: usize,
    drain_timeout: Duration,
}

impl StreamDispatcher {
    pub fn new(
        options: &AgentOptions,
        local_connector: Arc<dyn LocalConnector>,
        policy: Arc<dyn DestinationPolicy>,
    ) -> Self {
        Self {
            local_connector,
            policy,
            registry: StreamRegistry::new(),
            tracker: Mutex::new(None),
            window: options.window_size.max(1),
            read_chunk_size: options.read_chunk_size,
            drain_timeout: options.session.drain_timeout,
        }
    }

    async fn reply(&self, ctx: &GenerationContext, frame: Frame) {
        if ctx.outbound.send(frame).await.is_err() {
            debug!(generation = ctx.generation, "Control channel closed, reply dropped");
        }
    }

    async fn open_stream(
        &self,
        ctx: &GenerationContext,
        stream_id: StreamId,
        destination: String,
        transport: StreamTransport,
    ) {
        if !self.policy.is_allowed(&destination) {
            warn!(
                stream_id,
                generation = ctx.generation,
                destination = %destination,
                "Destination rejected by policy"
            );
            let error = StreamError::new(
                StreamErrorCode::Unauthorized,
                format!("destination {} is not allowed", destination),
            );
            self.reply(ctx, Frame::error(stream_id, &error)).await;
            return;
        }

        let shared = Arc::new(StreamShared::new(
            stream_id,
            destination,
            transport,
            ctx.generation,
            self.window,
            ctx.cancel.child_token(),
        ));

        let Some((serial, inbound)) = self.registry.register(shared.clone()).await else {
            warn!(
                stream_id,
                generation = ctx.generation,
                "Open for a stream id that is still live"
            );
            let error = StreamError::new(
                StreamErrorCode::InvalidStream,
                format!("stream {} is already open", stream_id),
            );
            self.reply(ctx, Frame::error(stream_id, &error)).await;
            return;
        };

        debug!(
            stream_id,
            generation = ctx.generation,
            destination = %shared.destination,
            transport = %transport,
            "Opening stream"
        );

        let relay = StreamRelay {
            shared,
            serial,
            inbound,
            outbound: ctx.outbound.clone(),
            registry: self.registry.clone(),
            connector: self.local_connector.clone(),
            generation_cancel: ctx.cancel.clone(),
            read_chunk_size: self.read_chunk_size,
            window: self.window,
        };

        let tracker = self.tracker.lock().await;
        match tracker.as_ref() {
            Some(tracker) => {
                tracker.spawn(relay.run());
            }
            None => {
                warn!(stream_id, generation = ctx.generation, "Open after generation ended");
                self.registry.remove(stream_id, serial).await;
            }
        }
    }

    async fn on_data(&self, ctx: &GenerationContext, stream_id: StreamId, payload: Bytes) {
        if payload.is_empty() {
            trace!(stream_id, "Ignoring empty data frame");
            return;
        }

        let Some(entry) = self.registry.get(stream_id).await else {
            debug!(stream_id, len = payload.len(), "Data for unknown stream dropped");
            return;
        };

        // Deduct without waiting; a broker ignoring the window loses the stream
        let credit = &entry.shared.inbound_credit;
        let granted = u32::try_from(payload.len())
            .ok()
            .and_then(|len| credit.try_acquire_many(len).ok());

        match granted {
            Some(permit) => permit.forget(),
            None => {
                warn!(
                    stream_id,
                    generation = ctx.generation,
                    len = payload.len(),
                    available = credit.available_permits(),
                    "Broker exceeded the stream window"
                );
                entry.shared.cancel.cancel();
                // One error per stream; later frames for the id are dropped
                self.registry.remove(stream_id, entry.serial).await;
                let error = StreamError::new(
                    StreamErrorCode::FlowControl,
                    format!(
                        "received {} bytes with {} bytes of window left",
                        payload.len(),
                        credit.available_permits()
                    ),
                );
                self.reply(ctx, Frame::error(stream_id, &error)).await;
                return;
            }
        }

        if entry.inbound.send(Inbound::Data(payload)).is_err() {
            debug!(stream_id, "Relay already finished, data dropped");
        }
    }

    async fn on_close(&self, stream_id: StreamId, reason: String) {
        match self.registry.get(stream_id).await {
            Some(entry) => {
                debug!(stream_id, %reason, "Broker closed stream");
                let _ = entry.inbound.send(Inbound::Close(reason));
            }
            None => debug!(stream_id, "Close for unknown stream"),
        }
    }

    async fn on_error(&self, stream_id: StreamId, code: StreamErrorCode, message: String) {
        match self.registry.get(stream_id).await {
            Some(entry) => {
                info!(stream_id, %code, %message, "Broker aborted stream");
                entry.shared.cancel.cancel();
            }
            None => debug!(stream_id, %code, "Error for unknown stream"),
        }
    }

    async fn on_window_update(&self, stream_id: StreamId, increment: u32) {
        let Some(entry) = self.registry.get(stream_id).await else {
            trace!(stream_id, "Window update for unknown stream");
            return;
        };

        // Credit never grows beyond the window
        let credit = &entry.shared.outbound_credit;
        let outstanding = (self.window as usize).saturating_sub(credit.available_permits());
        let granted = (increment as usize).min(outstanding);
        if granted < increment as usize {
            debug!(stream_id, increment, granted, "Clamped window update");
        }
        credit.add_permits(granted);
    }

    pub async fn active_streams(&self) -> usize {
        self.registry.len().await
    }

    pub async fn streams(&self) -> Vec<StreamInfo> {
        self.registry.snapshot().await
    }
}

#[async_trait]
impl FrameHandler for StreamDispatcher {
    async fn generation_started(&self, ctx: &GenerationContext) {
        *self.tracker.lock().await = Some(TaskTracker::new());
        debug!(generation = ctx.generation, "Accepting streams");
    }

    async fn handle_frame(&self, ctx: &GenerationContext, frame: Frame) {
        match frame {
            Frame::Open {
                stream_id,
                destination,
                transport,
            } => self.open_stream(ctx, stream_id, destination, transport).await,
            Frame::Data { stream_id, payload } => self.on_data(ctx, stream_id, payload).await,
            Frame::Close { stream_id, reason } => self.on_close(stream_id, reason).await,
            Frame::Error {
                stream_id,
                code,
                message,
            } => self.on_error(stream_id, code, message).await,
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment).await,
            Frame::Ping { .. } | Frame::Pong { .. } => {
                trace!("Keepalive frame reached the dispatcher");
            }
        }
    }

    async fn generation_ended(&self, ctx: &GenerationContext) {
        let tracker = self.tracker.lock().await.take();

        if let Some(tracker) = tracker {
            tracker.close();
            let live = tracker.len();
            if live > 0 {
                info!(generation = ctx.generation, live, "Closing streams");
            }
            if tokio::time::timeout(self.drain_timeout, tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    generation = ctx.generation,
                    remaining = tracker.len(),
                    "Relays did not finish within the drain timeout"
                );
            }
        }

        let abandoned = self.registry.clear_generation(ctx.generation).await;
        if abandoned > 0 {
            warn!(generation = ctx.generation, abandoned, "Dropped streams left behind");
        }
    }
}

/// The agent: one broker session plus the relays it carries
pub struct AgentProxy {
    options: AgentOptions,
    channel_connector: Arc<dyn ChannelConnector>,
    dispatcher: Arc<StreamDispatcher>,
    session: OnceLock<BrokerSession>,
}

impl AgentProxy {
    pub fn new(
        options: AgentOptions,
        channel_connector: Arc<dyn ChannelConnector>,
        local_connector: Arc<dyn LocalConnector>,
        policy: Arc<dyn DestinationPolicy>,
    ) -> Self {
        let dispatcher = Arc::new(StreamDispatcher::new(&options, local_connector, policy));

        Self {
            options,
            channel_connector,
            dispatcher,
            session: OnceLock::new(),
        }
    }

    /// Install the identity used for the control channel
    pub fn init(&self, keys: KeyPair) -> Result<(), AgentError> {
        self.options.validate()?;
        info!(
            namespace = keys.namespace(),
            issued_at = %keys.issued_at(),
            "Agent identity loaded"
        );

        let session = BrokerSession::new(
            self.options.session.clone(),
            self.channel_connector.clone(),
            self.dispatcher.clone(),
            keys,
        )?;
        self.session
            .set(session)
            .map_err(|_| AgentError::AlreadyInitialized)
    }

    fn session(&self) -> Result<&BrokerSession, AgentError> {
        self.session.get().ok_or(AgentError::NotInitialized)
    }

    pub async fn connect(&self) -> Result<(), AgentError> {
        self.session()?.connect().await?;
        Ok(())
    }

    /// Close every stream and the control channel; safe to call repeatedly
    pub async fn disconnect(&self) {
        if let Some(session) = self.session.get() {
            session.disconnect().await;
        }
    }

    /// Drop the current connection and start a clean generation
    ///
    /// Failed attempts are retried with backoff until connected or until
    /// `token` is cancelled. A rejected identity ends the retries.
    pub async fn reconnect(&self, token: &CancellationToken) -> Result<(), AgentError> {
        let session = self.session()?;
        session.disconnect().await;

        let mut backoff = Backoff::new(
            self.options.session.reconnect_delay,
            self.options.session.max_reconnect_delay,
        );
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            match session.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ ConnectionError::Unauthorized(_)) => return Err(e.into()),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .get()
            .map(BrokerSession::state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn subscribe_state(&self) -> Result<watch::Receiver<SessionState>, AgentError> {
        Ok(self.session()?.subscribe())
    }

    pub fn generation(&self) -> u64 {
        self.session
            .get()
            .map(BrokerSession::generation)
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<String> {
        self.session.get().and_then(BrokerSession::last_error)
    }

    pub async fn active_streams(&self) -> usize {
        self.dispatcher.active_streams().await
    }

    pub async fn streams(&self) -> Vec<StreamInfo> {
        self.dispatcher.streams().await
    }

    /// Wait for `token`, then shut down as [`AgentProxy::disconnect`] does
    pub async fn run_until_cancelled(&self, token: CancellationToken) {
        token.cancelled().await;
        info!("Shutdown requested");
        self.disconnect().await;
    }
}
