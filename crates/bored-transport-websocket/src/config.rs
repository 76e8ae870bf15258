//! WebSocket transport configuration

use crate::proxy::HttpConnectProxy;
use bored_cert::KeyPair;
use bored_proto::DEFAULT_MAX_FRAME_SIZE;
use bored_transport::tls::{ensure_crypto_provider, root_store, SkipVerification};
use bored_transport::{ConnectionError, TransportError, TransportResult};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Path the broker serves agent connections on
pub const AGENT_CONNECT_PATH: &str = "/agent/connect";

/// Client-side WebSocket configuration
#[derive(Clone)]
pub struct WebSocketConfig {
    /// `ws://` or `wss://` URL of the agent endpoint
    pub server_url: Url,

    /// Bearer token sent on the upgrade request
    token: String,

    /// Optional HTTP forward proxy
    pub proxy: Option<HttpConnectProxy>,

    /// Bound on TCP connect, proxy, TLS and WebSocket handshake together
    pub connect_timeout: Duration,

    /// Largest frame payload accepted from the broker
    pub max_frame_size: usize,

    /// Extra roots trusted for the broker certificate
    pub root_certs: Vec<CertificateDer<'static>>,

    /// Skip broker certificate verification (INSECURE)
    pub insecure: bool,
}

impl std::fmt::Debug for WebSocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConfig")
            .field("server_url", &self.server_url.as_str())
            .field("token", &"<redacted>")
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl WebSocketConfig {
    /// Build a configuration from the broker base address
    ///
    /// `http`/`ws` map to `ws`, `https`/`wss` map to `wss`, and
    /// [`AGENT_CONNECT_PATH`] is appended to any existing path.
    pub fn new(server: &str, token: impl Into<String>) -> TransportResult<Self> {
        Ok(Self {
            server_url: agent_url(server)?,
            token: token.into(),
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            root_certs: Vec::new(),
            insecure: false,
        })
    }

    pub fn with_proxy(mut self, proxy: HttpConnectProxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_root_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.root_certs = certs;
        self
    }

    /// Disable broker certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_secure(&self) -> bool {
        self.server_url.scheme() == "wss"
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.token.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Bearer token must not be empty".to_string(),
            ));
        }
        if self.server_url.host_str().is_none() {
            return Err(TransportError::ConfigurationError(format!(
                "Server URL has no host: {}",
                self.server_url
            )));
        }
        Ok(())
    }

    /// rustls client config presenting `identity` as the client certificate
    pub(crate) fn build_tls_config(
        &self,
        identity: &KeyPair,
    ) -> Result<Arc<rustls::ClientConfig>, ConnectionError> {
        ensure_crypto_provider();

        let chain = identity
            .certificate_chain()
            .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
        let key = identity
            .private_key_der()
            .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;

        let builder = if self.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let roots = root_store(&self.root_certs)
                .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let config = builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| {
                ConnectionError::HandshakeFailed(format!("Invalid client certificate: {}", e))
            })?;

        Ok(Arc::new(config))
    }
}

fn agent_url(server: &str) -> TransportResult<Url> {
    let mut url = Url::parse(server)
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid server URL: {}", e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::ConfigurationError(format!(
                "Unsupported server URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        TransportError::ConfigurationError(format!("Cannot use scheme {} for {}", scheme, server))
    })?;

    let path = format!("{}{}", url.path().trim_end_matches('/'), AGENT_CONNECT_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}
