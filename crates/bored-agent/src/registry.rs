//! Live streams of the current session generation

use bored_proto::{StreamId, StreamTransport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a relayed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Connecting to the local destination
    Opening,
    Relaying,
    Closing,
    Closed,
}

impl StreamState {
    fn as_u8(self) -> u8 {
        match self {
            StreamState::Opening => 0,
            StreamState::Relaying => 1,
            StreamState::Closing => 2,
            StreamState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Opening,
            1 => StreamState::Relaying,
            2 => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Opening => write!(f, "opening"),
            StreamState::Relaying => write!(f, "relaying"),
            StreamState::Closing => write!(f, "closing"),
            StreamState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a live stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub destination: String,
    pub transport: StreamTransport,
    pub state: StreamState,
    /// Bytes received from the broker and written locally
    pub bytes_in: u64,
    /// Bytes read locally and sent to the broker
    pub bytes_out: u64,
    pub generation: u64,
    pub opened_at: DateTime<Utc>,
}

/// Broker-to-local traffic handed from the dispatcher to a relay
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Close(String),
}

/// State shared between the dispatcher and one relay
pub(crate) struct StreamShared {
    pub stream_id: StreamId,
    pub destination: String,
    pub transport: StreamTransport,
    pub generation: u64,
    pub opened_at: DateTime<Utc>,
    state: AtomicU8,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Credit for `Data` we may send; replenished by the broker's `WindowUpdate`
    pub outbound_credit: Semaphore,
    /// Credit the broker may still use; replenished as bytes are written locally
    pub inbound_credit: Semaphore,
    /// Cancelled when the broker aborts the stream or the generation ends
    pub cancel: CancellationToken,
}

impl StreamShared {
    pub fn new(
        stream_id: StreamId,
        destination: String,
        transport: StreamTransport,
        generation: u64,
        window: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_id,
            destination,
            transport,
            generation,
            opened_at: Utc::now(),
            state: AtomicU8::new(StreamState::Opening.as_u8()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            outbound_credit: Semaphore::new(window as usize),
            inbound_credit: Semaphore::new(window as usize),
            cancel,
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.stream_id,
            destination: self.destination.clone(),
            transport: self.transport,
            state: self.state(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            generation: self.generation,
            opened_at: self.opened_at,
        }
    }
}

/// Registry entry; `serial` tells apart successive streams reusing an id
#[derive(Clone)]
pub(crate) struct StreamEntry {
    pub serial: u64,
    pub shared: Arc<StreamShared>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
}

/// Map of stream id to its live relay
#[derive(Clone, Default)]
pub(crate) struct StreamRegistry {
    streams: Arc<Mutex<HashMap<StreamId, StreamEntry>>>,
    next_serial: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream unless its id is still live
    ///
    /// Returns the receiving half of the stream's inbound queue.
    pub async fn register(
        &self,
        shared: Arc<StreamShared>,
    ) -> Option<(u64, mpsc::UnboundedReceiver<Inbound>)> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&shared.stream_id) {
            return None;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let stream_id = shared.stream_id;
        streams.insert(
            stream_id,
            StreamEntry {
                serial,
                shared,
                inbound: tx,
            },
        );

        tracing::debug!(
            stream_id,
            active_streams = streams.len(),
            "Stream registered"
        );
        Some((serial, rx))
    }

    pub async fn get(&self, stream_id: StreamId) -> Option<StreamEntry> {
        self.streams.lock().await.get(&stream_id).cloned()
    }

    /// Remove `stream_id` only if it still belongs to the relay holding `serial`
    pub async fn remove(&self, stream_id: StreamId, serial: u64) -> bool {
        let mut streams = self.streams.lock().await;
        match streams.get(&stream_id) {
            Some(entry) if entry.serial == serial => {
                streams.remove(&stream_id);
                tracing::debug!(
                    stream_id,
                    active_streams = streams.len(),
                    "Stream unregistered"
                );
                true
            }
            _ => false,
        }
    }

    /// Drop every stream of `generation`, cancelling relays still running
    pub async fn clear_generation(&self, generation: u64) -> usize {
        let mut streams = self.streams.lock().await;
        let before = streams.len();
        streams.retain(|_, entry| {
            if entry.shared.generation == generation {
                entry.shared.cancel.cancel();
                entry.shared.set_state(StreamState::Closed);
                false
            } else {
                true
            }
        });
        before - streams.len()
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<StreamInfo> {
        let streams = self.streams.lock().await;
        let mut infos: Vec<StreamInfo> = streams.values().map(|e| e.shared.info()).collect();
        infos.sort_by_key(|info| info.stream_id);
        infos
    }
}
