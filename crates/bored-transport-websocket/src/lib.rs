//! WebSocket control channel to the bored server
//!
//! The agent dials `<server>/agent/connect`, optionally through an HTTP
//! `CONNECT` forward proxy, authenticates with a bearer token plus its TLS
//! client certificate, and then exchanges binary WebSocket messages carrying
//! encoded frames. Inbound messages are fed through a
//! [`bored_proto::FrameDecoder`], so frames may span message boundaries.

pub mod config;
pub mod connector;
pub mod proxy;

pub use config::{WebSocketConfig, AGENT_CONNECT_PATH};
pub use connector::WebSocketConnector;
pub use proxy::HttpConnectProxy;
