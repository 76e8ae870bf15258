//! Connections to destinations inside the private network

use async_trait::async_trait;
use bored_proto::{StreamError, StreamErrorCode, StreamTransport};
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Byte stream to a local destination
pub trait LocalIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalIo for T {}

pub type LocalStream = Box<dyn LocalIo>;

/// Opens connections to stream destinations
#[async_trait]
pub trait LocalConnector: Send + Sync {
    async fn connect(
        &self,
        destination: &str,
        transport: StreamTransport,
    ) -> Result<LocalStream, StreamError>;
}

/// Split `host:port` or `[v6]:port`
pub fn split_host_port(destination: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = destination.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        destination.rsplit_once(':')?
    };

    if host.is_empty() || (host.contains(':') && !destination.starts_with('[')) {
        return None;
    }

    Some((host, port.parse().ok()?))
}

/// Plain TCP or TLS-over-TCP connector
pub struct TcpLocalConnector {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl std::fmt::Debug for TcpLocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLocalConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TcpLocalConnector {
    pub fn new(connect_timeout: Duration, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connect_timeout,
            tls: TlsConnector::from(tls_config),
        }
    }

    async fn open(
        &self,
        host: &str,
        port: u16,
        transport: StreamTransport,
    ) -> Result<LocalStream, StreamError> {
        let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
            StreamError::new(
                StreamErrorCode::DestinationUnreachable,
                format!("connect to {}:{} failed: {}", host, port, e),
            )
        })?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(host, port, error = %e, "Failed to set TCP_NODELAY");
        }

        match transport {
            StreamTransport::Plain => Ok(Box::new(tcp)),
            StreamTransport::Tls => {
                let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                    StreamError::new(
                        StreamErrorCode::DestinationUnreachable,
                        format!("invalid server name {}: {}", host, e),
                    )
                })?;

                let tls = self
                    .tls
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| tls_error(host, port, e))?;
                Ok(Box::new(tls))
            }
        }
    }
}

#[async_trait]
impl LocalConnector for TcpLocalConnector {
    async fn connect(
        &self,
        destination: &str,
        transport: StreamTransport,
    ) -> Result<LocalStream, StreamError> {
        let (host, port) = split_host_port(destination).ok_or_else(|| {
            StreamError::new(
                StreamErrorCode::DestinationUnreachable,
                format!("invalid destination {}", destination),
            )
        })?;

        debug!(destination, %transport, "Connecting to local destination");

        match tokio::time::timeout(self.connect_timeout, self.open(host, port, transport)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::new(
                StreamErrorCode::Timeout,
                format!(
                    "connect to {} timed out after {:?}",
                    destination, self.connect_timeout
                ),
            )),
        }
    }
}

/// Certificate rejections become `Untrusted`, anything else `DestinationUnreachable`
fn tls_error(host: &str, port: u16, e: io::Error) -> StreamError {
    let rejected = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|inner| matches!(inner, rustls::Error::InvalidCertificate(_)));

    let code = if rejected {
        StreamErrorCode::Untrusted
    } else {
        StreamErrorCode::DestinationUnreachable
    };

    StreamError::new(
        code,
        format!("TLS handshake with {}:{} failed: {}", host, port, e),
    )
}
