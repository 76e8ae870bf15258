//! Per-stream relay between the control channel and a local socket

use crate::registry::{Inbound, StreamRegistry, StreamShared, StreamState};
use bored_proto::{Frame, StreamError, StreamErrorCode};
use bored_transport::{LocalConnector, LocalStream};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close reason sent when the local side finished
pub const EOF_REASON: &str = "eof";

/// Close reason sent for streams still live when the session shuts down
pub const DISCONNECT_REASON: &str = "agent disconnecting";

/// Why a relay stopped
#[derive(Debug)]
enum Outcome {
    LocalEof,
    RemoteClosed(String),
    LocalError(io::Error),
    /// Broker error or flow control violation; the broker already knows
    Aborted,
    Disconnecting,
    ChannelClosed,
}

impl Outcome {
    fn reply(&self, stream_id: u32) -> Option<Frame> {
        match self {
            Outcome::LocalEof => Some(Frame::close(stream_id, EOF_REASON)),
            Outcome::LocalError(e) => Some(Frame::error(
                stream_id,
                &StreamError::new(StreamErrorCode::Reset, e.to_string()),
            )),
            Outcome::Disconnecting => Some(Frame::close(stream_id, DISCONNECT_REASON)),
            Outcome::RemoteClosed(_) | Outcome::Aborted | Outcome::ChannelClosed => None,
        }
    }

    fn reason(&self) -> String {
        match self {
            Outcome::LocalEof => "local eof".to_string(),
            Outcome::RemoteClosed(reason) => format!("closed by broker: {}", reason),
            Outcome::LocalError(e) => format!("local error: {}", e),
            Outcome::Aborted => "aborted".to_string(),
            Outcome::Disconnecting => DISCONNECT_REASON.to_string(),
            Outcome::ChannelClosed => "control channel closed".to_string(),
        }
    }
}

/// Relays one stream until either side closes it
pub(crate) struct StreamRelay {
    pub shared: Arc<StreamShared>,
    pub serial: u64,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    pub outbound: mpsc::Sender<Frame>,
    pub registry: StreamRegistry,
    pub connector: Arc<dyn LocalConnector>,
    /// Token of the whole generation, to tell shutdown from a stream abort
    pub generation_cancel: CancellationToken,
    pub read_chunk_size: usize,
    pub window: u32,
}

impl StreamRelay {
    pub async fn run(mut self) {
        let shared = self.shared.clone();
        let stream_id = shared.stream_id;

        let connected = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            result = self.connector.connect(&shared.destination, shared.transport) => Some(result),
        };

        let local = match connected {
            Some(Ok(local)) => local,
            Some(Err(e)) => {
                // Free the id before the broker hears about the failure
                self.registry.remove(stream_id, self.serial).await;
                shared.set_state(StreamState::Closed);
                warn!(
                    stream_id,
                    generation = shared.generation,
                    destination = %shared.destination,
                    code = %e.code,
                    error = %e.message,
                    "Failed to open local connection"
                );
                let _ = self.outbound.send(Frame::error(stream_id, &e)).await;
                return;
            }
            None => {
                let outcome = self.cancelled_outcome();
                self.finish(outcome).await;
                return;
            }
        };

        shared.set_state(StreamState::Relaying);
        info!(
            stream_id,
            generation = shared.generation,
            destination = %shared.destination,
            transport = %shared.transport,
            "Stream opened"
        );

        let outcome = self.relay(local).await;
        self.finish(outcome).await;
    }

    fn cancelled_outcome(&self) -> Outcome {
        if self.generation_cancel.is_cancelled() {
            Outcome::Disconnecting
        } else {
            Outcome::Aborted
        }
    }

    async fn relay(&mut self, local: LocalStream) -> Outcome {
        let (mut reader, mut writer) = tokio::io::split(local);
        let chunk = self.read_chunk_size.clamp(1, self.window as usize);

        let outcome = tokio::select! {
            _ = self.shared.cancel.cancelled() => None,
            outcome = local_to_broker(
                &mut reader,
                &self.shared,
                &self.outbound,
                chunk,
                self.window,
            ) => Some(outcome),
            outcome = broker_to_local(
                &mut writer,
                &mut self.inbound,
                &self.shared,
                &self.outbound,
                self.window,
            ) => Some(outcome),
        };

        outcome.unwrap_or_else(|| self.cancelled_outcome())
    }

    async fn finish(self, outcome: Outcome) {
        let shared = &self.shared;
        shared.set_state(StreamState::Closing);
        self.registry.remove(shared.stream_id, self.serial).await;

        if let Some(frame) = outcome.reply(shared.stream_id) {
            if self.outbound.send(frame).await.is_err() {
                debug!(stream_id = shared.stream_id, "Control channel gone before close was sent");
            }
        }
        shared.set_state(StreamState::Closed);

        info!(
            stream_id = shared.stream_id,
            generation = shared.generation,
            destination = %shared.destination,
            bytes_in = shared.bytes_in(),
            bytes_out = shared.bytes_out(),
            reason = %outcome.reason(),
            "Stream closed"
        );
    }
}

/// Read the local socket into `Data` frames, never reading more than the
/// broker has granted
async fn local_to_broker(
    reader: &mut ReadHalf<LocalStream>,
    shared: &StreamShared,
    outbound: &mpsc::Sender<Frame>,
    chunk: usize,
    window: u32,
) -> Outcome {
    let credit = &shared.outbound_credit;
    let mut buf = vec![0u8; chunk];

    loop {
        match credit.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Outcome::Aborted,
        }
        let mut granted = 1;
        let extra = credit.available_permits().min(chunk - 1);
        if extra > 0 {
            if let Ok(permits) = credit.try_acquire_many(extra as u32) {
                permits.forget();
                granted += extra;
            }
        }

        let n = match reader.read(&mut buf[..granted]).await {
            Ok(0) => return Outcome::LocalEof,
            Ok(n) => n,
            Err(e) => return Outcome::LocalError(e),
        };

        // Hand back the unused part of the reservation
        if n < granted {
            let room = (window as usize).saturating_sub(credit.available_permits());
            credit.add_permits((granted - n).min(room));
        }

        let frame = Frame::data(shared.stream_id, Bytes::copy_from_slice(&buf[..n]));
        if outbound.send(frame).await.is_err() {
            return Outcome::ChannelClosed;
        }
        shared.add_bytes_out(n as u64);
    }
}

/// Write broker data locally and hand credit back once a quarter window is used
async fn broker_to_local(
    writer: &mut WriteHalf<LocalStream>,
    inbound: &mut mpsc::UnboundedReceiver<Inbound>,
    shared: &StreamShared,
    outbound: &mpsc::Sender<Frame>,
    window: u32,
) -> Outcome {
    let threshold = (window / 4).max(1);
    let mut consumed: u32 = 0;

    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Data(payload) => {
                if let Err(e) = writer.write_all(&payload).await {
                    return Outcome::LocalError(e);
                }
                if let Err(e) = writer.flush().await {
                    return Outcome::LocalError(e);
                }

                shared.add_bytes_in(payload.len() as u64);
                consumed += payload.len() as u32;

                if consumed >= threshold {
                    shared.inbound_credit.add_permits(consumed as usize);
                    if outbound
                        .send(Frame::window_update(shared.stream_id, consumed))
                        .await
                        .is_err()
                    {
                        return Outcome::ChannelClosed;
                    }
                    consumed = 0;
                }
            }
            Inbound::Close(reason) => {
                let _ = writer.shutdown().await;
                return Outcome::RemoteClosed(reason);
            }
        }
    }

    Outcome::Aborted
}
