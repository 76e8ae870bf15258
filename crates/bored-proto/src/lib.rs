//! Tunnel Protocol Definitions
//!
//! This crate defines the frame format spoken between the agent and the
//! bored server over the single control channel, plus the streaming decoder
//! that turns arbitrary byte chunks back into frames.
//!
//! Every frame is laid out as:
//!
//! ```text
//! | kind (1) | stream_id (4, BE) | length (4, BE) | payload (length) |
//! ```

pub mod codec;
pub mod mux;

pub use codec::{CodecError, FrameCodec, FrameDecoder};
pub use mux::{
    Frame, FrameKind, ProtocolError, StreamError, StreamErrorCode, StreamId, StreamTransport,
};

/// Default maximum payload size accepted from the peer (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reserved stream ID for session-level frames (Ping/Pong)
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Initial per-stream flow control window, in bytes, for each direction
pub const INITIAL_WINDOW: u32 = 256 * 1024;
