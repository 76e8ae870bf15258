//! Transport abstractions for the agent
//!
//! Two capabilities are injected into the agent:
//!
//! ```text
//!            ┌────────────────────────────┐
//!            │        bored-agent         │
//!            └────────────────────────────┘
//!               │                      │
//!               ↓                      ↓
//!   ┌──────────────────────┐  ┌──────────────────────┐
//!   │   ChannelConnector   │  │    LocalConnector    │
//!   │ (broker, one socket) │  │ (one per stream)     │
//!   └──────────────────────┘  └──────────────────────┘
//!               │                      │
//!   bored-transport-websocket   TcpLocalConnector (plain / TLS)
//! ```
//!
//! A [`ControlChannel`] is a framed duplex carrying [`bored_proto::Frame`]s;
//! a [`LocalStream`] is a raw byte stream to a destination inside the
//! private network.

pub mod channel;
pub mod local;
pub mod tls;

pub use channel::{ChannelConnector, ControlChannel, FrameSink, FrameStream};
pub use local::{split_host_port, LocalConnector, LocalIo, LocalStream, TcpLocalConnector};
pub use tls::{ensure_crypto_provider, IdpCertVerifier, LocalTlsConfig, SkipVerification};

use bored_proto::{CodecError, ProtocolError};
use thiserror::Error;

/// Failure to establish the control channel
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The broker rejected our credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// DNS, TCP, proxy or timeout failure
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// TLS or WebSocket negotiation failure
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Errors on an established control channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Protocol(e) => ChannelError::Protocol(e),
            CodecError::Io(e) => ChannelError::Io(e),
        }
    }
}

/// Configuration-time transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport setup
pub type TransportResult<T> = Result<T, TransportError>;
