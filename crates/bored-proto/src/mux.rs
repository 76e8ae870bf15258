//! Multiplexing primitives for the control channel

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame kinds carried on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 1,
    Data = 2,
    Close = 3,
    Error = 4,
    Ping = 5,
    Pong = 6,
    WindowUpdate = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Close),
            4 => Ok(FrameKind::Error),
            5 => Ok(FrameKind::Ping),
            6 => Ok(FrameKind::Pong),
            7 => Ok(FrameKind::WindowUpdate),
            _ => Err(ProtocolError::Malformed(format!(
                "unknown frame kind {}",
                value
            ))),
        }
    }
}

/// How the agent reaches the destination of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTransport {
    Plain,
    Tls,
}

impl StreamTransport {
    pub fn as_u8(&self) -> u8 {
        match self {
            StreamTransport::Plain => 0,
            StreamTransport::Tls => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(StreamTransport::Plain),
            1 => Ok(StreamTransport::Tls),
            _ => Err(ProtocolError::Malformed(format!(
                "unknown stream transport {}",
                value
            ))),
        }
    }
}

impl fmt::Display for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTransport::Plain => write!(f, "plain"),
            StreamTransport::Tls => write!(f, "tls"),
        }
    }
}

/// Error codes reported back to the broker for a single stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorCode {
    /// Destination rejected by the agent's policy
    Unauthorized,
    /// Destination presented a certificate the agent does not trust
    Untrusted,
    DestinationUnreachable,
    Timeout,
    /// Local connection failed after it was established
    Reset,
    /// Peer sent more data than the advertised window
    FlowControl,
    /// Open for an id that is still live, or a frame that makes no sense for the stream
    InvalidStream,
    Unknown(u8),
}

impl StreamErrorCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            StreamErrorCode::Unauthorized => 1,
            StreamErrorCode::Untrusted => 2,
            StreamErrorCode::DestinationUnreachable => 3,
            StreamErrorCode::Timeout => 4,
            StreamErrorCode::Reset => 5,
            StreamErrorCode::FlowControl => 6,
            StreamErrorCode::InvalidStream => 7,
            StreamErrorCode::Unknown(code) => *code,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamErrorCode::Unauthorized,
            2 => StreamErrorCode::Untrusted,
            3 => StreamErrorCode::DestinationUnreachable,
            4 => StreamErrorCode::Timeout,
            5 => StreamErrorCode::Reset,
            6 => StreamErrorCode::FlowControl,
            7 => StreamErrorCode::InvalidStream,
            other => StreamErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for StreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamErrorCode::Unauthorized => write!(f, "unauthorized"),
            StreamErrorCode::Untrusted => write!(f, "untrusted"),
            StreamErrorCode::DestinationUnreachable => write!(f, "destination unreachable"),
            StreamErrorCode::Timeout => write!(f, "timeout"),
            StreamErrorCode::Reset => write!(f, "reset"),
            StreamErrorCode::FlowControl => write!(f, "flow control violation"),
            StreamErrorCode::InvalidStream => write!(f, "invalid stream"),
            StreamErrorCode::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}

/// A failure scoped to one stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct StreamError {
    pub code: StreamErrorCode,
    pub message: String,
}

impl StreamError {
    pub fn new(code: StreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors raised while parsing frames from the peer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// A single multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open {
        stream_id: StreamId,
        destination: String,
        transport: StreamTransport,
    },
    Data {
        stream_id: StreamId,
        payload: Bytes,
    },
    Close {
        stream_id: StreamId,
        reason: String,
    },
    Error {
        stream_id: StreamId,
        code: StreamErrorCode,
        message: String,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
}

impl Frame {
    /// Frame header size: kind (1) + stream_id (4) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn open(
        stream_id: StreamId,
        destination: impl Into<String>,
        transport: StreamTransport,
    ) -> Self {
        Frame::Open {
            stream_id,
            destination: destination.into(),
            transport,
        }
    }

    pub fn data(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Frame::Data {
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn close(stream_id: StreamId, reason: impl Into<String>) -> Self {
        Frame::Close {
            stream_id,
            reason: reason.into(),
        }
    }

    pub fn error(stream_id: StreamId, error: &StreamError) -> Self {
        Frame::Error {
            stream_id,
            code: error.code,
            message: error.message.clone(),
        }
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Frame::WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Open { .. } => FrameKind::Open,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Close { .. } => FrameKind::Close,
            Frame::Error { .. } => FrameKind::Error,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::Pong { .. } => FrameKind::Pong,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Close { stream_id, .. }
            | Frame::Error { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Pong { .. } => crate::CONTROL_STREAM_ID,
        }
    }

    /// Size of the payload this frame will carry on the wire
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Open { destination, .. } => 1 + destination.len(),
            Frame::Data { payload, .. } => payload.len(),
            Frame::Close { reason, .. } => reason.len(),
            Frame::Error { message, .. } => 1 + message.len(),
            Frame::Ping { .. } | Frame::Pong { .. } => 8,
            Frame::WindowUpdate { .. } => 4,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = self.payload_len();
        let length = u32::try_from(payload_len).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload_len,
            max: u32::MAX as usize,
        })?;

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u8(self.kind() as u8);
        buf.put_u32(self.stream_id());
        buf.put_u32(length);

        match self {
            Frame::Open {
                destination,
                transport,
                ..
            } => {
                buf.put_u8(transport.as_u8());
                buf.put_slice(destination.as_bytes());
            }
            Frame::Data { payload, .. } => buf.put_slice(payload),
            Frame::Close { reason, .. } => buf.put_slice(reason.as_bytes()),
            Frame::Error { code, message, .. } => {
                buf.put_u8(code.as_u8());
                buf.put_slice(message.as_bytes());
            }
            Frame::Ping { nonce } | Frame::Pong { nonce } => buf.put_u64(*nonce),
            Frame::WindowUpdate { increment, .. } => buf.put_u32(*increment),
        }

        Ok(())
    }

    /// Decode exactly one complete frame from `buf`
    ///
    /// Use [`crate::FrameDecoder`] when the input arrives in arbitrary chunks.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "truncated header: {} bytes",
                buf.len()
            )));
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let kind = header.get_u8();
        let stream_id = header.get_u32();
        let length = header.get_u32() as usize;

        let payload = &buf[Self::HEADER_SIZE..];
        if payload.len() != length {
            return Err(ProtocolError::Malformed(format!(
                "declared length {} but {} payload bytes present",
                length,
                payload.len()
            )));
        }

        Self::from_parts(kind, stream_id, Bytes::copy_from_slice(payload))
    }

    /// Build a frame from an already split header and payload
    pub fn from_parts(kind: u8, stream_id: StreamId, mut payload: Bytes) -> Result<Self, ProtocolError> {
        let kind = FrameKind::try_from(kind)?;

        match kind {
            FrameKind::Ping | FrameKind::Pong => {
                if stream_id != crate::CONTROL_STREAM_ID {
                    return Err(ProtocolError::Malformed(format!(
                        "{:?} on stream {} (must be {})",
                        kind,
                        stream_id,
                        crate::CONTROL_STREAM_ID
                    )));
                }
                if payload.len() != 8 {
                    return Err(ProtocolError::Malformed(format!(
                        "{:?} payload must be 8 bytes, got {}",
                        kind,
                        payload.len()
                    )));
                }
                let nonce = payload.get_u64();
                Ok(if kind == FrameKind::Ping {
                    Frame::Ping { nonce }
                } else {
                    Frame::Pong { nonce }
                })
            }
            _ if stream_id == crate::CONTROL_STREAM_ID => Err(ProtocolError::Malformed(format!(
                "{:?} frame on reserved stream {}",
                kind,
                crate::CONTROL_STREAM_ID
            ))),
            FrameKind::Open => {
                if payload.is_empty() {
                    return Err(ProtocolError::Malformed("empty open payload".to_string()));
                }
                let transport = StreamTransport::from_u8(payload.get_u8())?;
                let destination = utf8(payload, "destination")?;
                if destination.is_empty() {
                    return Err(ProtocolError::Malformed("empty destination".to_string()));
                }
                Ok(Frame::Open {
                    stream_id,
                    destination,
                    transport,
                })
            }
            FrameKind::Data => Ok(Frame::Data { stream_id, payload }),
            FrameKind::Close => Ok(Frame::Close {
                stream_id,
                reason: utf8(payload, "close reason")?,
            }),
            FrameKind::Error => {
                if payload.is_empty() {
                    return Err(ProtocolError::Malformed("empty error payload".to_string()));
                }
                let code = StreamErrorCode::from_u8(payload.get_u8());
                Ok(Frame::Error {
                    stream_id,
                    code,
                    message: utf8(payload, "error message")?,
                })
            }
            FrameKind::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(ProtocolError::Malformed(format!(
                        "window update payload must be 4 bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(Frame::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32(),
                })
            }
        }
    }
}

fn utf8(payload: Bytes, what: &str) -> Result<String, ProtocolError> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| ProtocolError::Malformed(format!("{} is not valid UTF-8: {}", what, e)))
}
