//! Bored Agent Library
//!
//! The agent keeps one authenticated control channel open to the bored
//! server and relays every stream the server opens over it to a destination
//! inside the private network.
//!
//! # Architecture
//!
//! ```text
//! bored server ══ control channel ══ BrokerSession ── StreamDispatcher
//!                                                        │
//!                                        ┌───────────────┼───────────────┐
//!                                        ↓               ↓               ↓
//!                                   StreamRelay     StreamRelay     StreamRelay
//!                                        │               │               │
//!                                   10.0.0.5:443   kubernetes:443      ...
//! ```
//!
//! - [`BrokerSession`] owns connect/reconnect, keepalive and the socket writer
//! - [`AgentProxy`] wires the session to the stream registry and relays
//! - [`DestinationPolicy`] decides which destinations may be opened
//!
//! # Usage
//!
//! ```ignore
//! let proxy = AgentProxy::new(options, channel_connector, local_connector, policy);
//! proxy.init(keys)?;
//! proxy.connect().await?;
//! proxy.run_until_cancelled(shutdown).await;
//! ```

pub mod config;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::{AgentOptions, AllowlistConfig, ConfigError, FileConfig, SessionConfig};
pub use policy::{AllowAll, Allowlist, DestinationPolicy};
pub use proxy::AgentProxy;
pub use registry::{StreamInfo, StreamState};
pub use session::{BrokerSession, FrameHandler, GenerationContext, SessionState};

use bored_transport::ConnectionError;
use thiserror::Error;

/// Errors surfaced by the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent not initialized: init() must be called with a key pair before connect()")]
    NotInitialized,

    #[error("Agent already initialized")]
    AlreadyInitialized,

    #[error("Invalid allowlist configuration: {0}")]
    InvalidAllowlist(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
