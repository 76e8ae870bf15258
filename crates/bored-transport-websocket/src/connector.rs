//! WebSocket connector for the broker control channel

use crate::config::WebSocketConfig;
use async_trait::async_trait;
use bored_cert::KeyPair;
use bored_proto::{Frame, FrameDecoder};
use bored_transport::{ChannelConnector, ChannelError, ConnectionError, ControlChannel};
use futures_util::{future, stream, SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace};

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type WsStream = WebSocketStream<Box<dyn Io>>;

/// Dials the broker's agent endpoint
pub struct WebSocketConnector {
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("server_url", &self.config.server_url.as_str())
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> bored_transport::TransportResult<Self> {
        config.validate()?;

        debug!(url = %config.server_url, "WebSocket connector created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    async fn establish(&self, identity: &KeyPair) -> Result<ControlChannel, ConnectionError> {
        let url = &self.config.server_url;
        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => {
                return Err(ConnectionError::HandshakeFailed(format!(
                    "Server URL has no host: {}",
                    url
                )))
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        // Connect TCP, directly or through the proxy
        let tcp = match &self.config.proxy {
            Some(proxy) => proxy.connect(&host, port).await?,
            None => TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
                ConnectionError::NetworkUnreachable(format!(
                    "TCP connect to {}:{} failed: {}",
                    host, port, e
                ))
            })?,
        };
        if let Err(e) = tcp.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        let io: Box<dyn Io> = if self.config.is_secure() {
            let tls_config = self.config.build_tls_config(identity)?;
            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                ConnectionError::HandshakeFailed(format!("Invalid server name {}: {}", host, e))
            })?;

            let tls = TlsConnector::from(tls_config)
                .connect(server_name, tcp)
                .await
                .map_err(|e| ConnectionError::HandshakeFailed(format!("TLS handshake failed: {}", e)))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::HandshakeFailed(format!("Invalid request: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token()))
            .map_err(|e| ConnectionError::HandshakeFailed(format!("Invalid token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let mut ws_config = TungsteniteConfig::default();
        ws_config.max_message_size = Some(self.config.max_frame_size + Frame::HEADER_SIZE);

        let (ws_stream, response) =
            tokio_tungstenite::client_async_with_config(request, io, Some(ws_config))
                .await
                .map_err(handshake_error)?;

        info!(
            url = %url,
            status = %response.status(),
            proxied = self.config.proxy.is_some(),
            "WebSocket connection established"
        );

        Ok(channel_from_websocket(
            ws_stream,
            self.config.max_frame_size,
            url.to_string(),
        ))
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, identity: &KeyPair) -> Result<ControlChannel, ConnectionError> {
        match tokio::time::timeout(self.config.connect_timeout, self.establish(identity)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::NetworkUnreachable(format!(
                "Connecting to {} timed out after {:?}",
                self.config.server_url, self.config.connect_timeout
            ))),
        }
    }
}

fn handshake_error(e: WsError) -> ConnectionError {
    match e {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            ConnectionError::Unauthorized(format!("Server rejected token: {}", response.status()))
        }
        WsError::Http(response) => ConnectionError::HandshakeFailed(format!(
            "Unexpected upgrade response: {}",
            response.status()
        )),
        WsError::Io(e) => ConnectionError::NetworkUnreachable(e.to_string()),
        other => ConnectionError::HandshakeFailed(other.to_string()),
    }
}

/// Adapt a WebSocket into a frame channel
///
/// Each outbound frame is sent as one binary message; inbound binary messages
/// are treated as a byte stream.
fn channel_from_websocket(ws: WsStream, max_frame_size: usize, peer: String) -> ControlChannel {
    let (ws_sink, ws_source) = ws.split();

    let sink = ws_sink
        .sink_map_err(|e| ChannelError::Transport(e.to_string()))
        .with(|frame: Frame| {
            future::ready(
                frame
                    .encode()
                    .map(|bytes| Message::Binary(bytes.to_vec()))
                    .map_err(ChannelError::from),
            )
        });

    let frames = stream::unfold(
        (ws_source, FrameDecoder::new(max_frame_size), false),
        |(mut source, mut decoder, failed)| async move {
            if failed {
                return None;
            }
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => return Some((Ok(frame), (source, decoder, false))),
                    Err(e) => return Some((Err(e.into()), (source, decoder, false))),
                    Ok(None) => {}
                }

                match source.next().await {
                    Some(Ok(Message::Binary(data))) => decoder.push(&data),
                    Some(Ok(Message::Close(reason))) => {
                        debug!(?reason, "Broker closed the WebSocket");
                        return None;
                    }
                    Some(Ok(other)) => trace!(?other, "Ignoring non-binary WebSocket message"),
                    Some(Err(e)) => {
                        return Some((
                            Err(ChannelError::Transport(e.to_string())),
                            (source, decoder, true),
                        ))
                    }
                    None => return None,
                }
            }
        },
    );

    ControlChannel::new(Box::pin(sink), Box::pin(frames), peer)
}
