//! Control channel to the broker

use crate::{ChannelError, ConnectionError};
use async_trait::async_trait;
use bored_cert::KeyPair;
use bored_proto::{Frame, FrameCodec};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Outbound half of a control channel
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;

/// Inbound half of a control channel
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ChannelError>> + Send>>;

/// An established, authenticated duplex carrying frames
///
/// The stream ends (`None`) when the peer closes the channel.
pub struct ControlChannel {
    sink: FrameSink,
    stream: FrameStream,
    peer: String,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("peer", &self.peer)
            .finish()
    }
}

impl ControlChannel {
    pub fn new(sink: FrameSink, stream: FrameStream, peer: impl Into<String>) -> Self {
        Self {
            sink,
            stream,
            peer: peer.into(),
        }
    }

    /// Frame a raw byte stream with [`FrameCodec`]
    pub fn from_io<T>(io: T, max_frame_size: usize, peer: impl Into<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, FrameCodec::new(max_frame_size)).split();

        Self::new(
            Box::pin(sink.sink_map_err(ChannelError::from)),
            Box::pin(stream.map(|r| r.map_err(ChannelError::from))),
            peer,
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

/// Establishes control channels to the broker
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a new channel, authenticating with `identity`
    async fn connect(&self, identity: &KeyPair) -> Result<ControlChannel, ConnectionError>;
}
