//! bored agent - reverse tunnel from a private network to the bored server
//!
//! Keeps one authenticated WebSocket control channel to the server and
//! relays the TCP/TLS streams the server opens to destinations inside the
//! cluster. Reconnects on its own; stops on SIGTERM/SIGINT and starts a
//! fresh connection on SIGHUP.

use anyhow::{anyhow, Context, Result};
use bored_agent::{
    AgentOptions, AgentProxy, Allowlist, AllowlistConfig, FileConfig, SessionConfig,
};
use bored_cert::{CertificateSigner, KeyPairManager, KubeSecretStore};
use bored_transport::{LocalTlsConfig, TcpLocalConnector};
use bored_transport_websocket::{HttpConnectProxy, WebSocketConfig, WebSocketConnector};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// bored agent - expose in-cluster services to the bored server
#[derive(Parser, Debug)]
#[command(name = "bored-agent")]
#[command(version)]
struct Cli {
    /// Server base URL (http/ws or https/wss)
    #[arg(long, env = "BORED_SERVER", default_value = "http://bored:8080")]
    server: String,

    /// Bearer token for the agent endpoint
    #[arg(long, env = "BORED_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Namespace the agent identity belongs to
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,

    /// HTTP forward proxy for the control channel (http://[user:pass@]host:port)
    #[arg(long, env = "HTTPS_PROXY")]
    https_proxy: Option<String>,

    /// PEM public key used to verify relayed TLS destinations
    #[arg(long, env = "IDP_PUBLIC_KEY", hide_env_values = true)]
    idp_public_key: Option<String>,

    /// Read-only directory with tls.crt/tls.key preferred over the secret store
    #[arg(long, env = "BORED_KEYS_DIR")]
    keys_dir: Option<PathBuf>,

    /// CA bundle trusted for relayed TLS destinations
    #[arg(long, env = "BORED_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// CA certificate used to sign the generated agent certificate
    #[arg(long, env = "BORED_SIGNER_CERT", requires = "signer_key")]
    signer_cert: Option<PathBuf>,

    /// Private key of the signing CA
    #[arg(long, env = "BORED_SIGNER_KEY", requires = "signer_cert")]
    signer_key: Option<PathBuf>,

    /// YAML file with the destination allowlist and tunables
    #[arg(long, env = "BORED_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between keepalive pings
    #[arg(long)]
    keepalive_interval: Option<u64>,

    /// Seconds to wait for a keepalive pong
    #[arg(long)]
    keepalive_timeout: Option<u64>,

    /// Seconds allowed for establishing the control channel
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Seconds allowed for connecting to a destination
    #[arg(long)]
    local_connect_timeout: Option<u64>,

    /// Initial reconnect delay in seconds
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Maximum reconnect delay in seconds
    #[arg(long)]
    max_reconnect_delay: Option<u64>,

    /// Largest frame payload accepted from the server
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Skip server certificate verification (insecure, for development only)
    #[arg(long, env = "BORED_INSECURE")]
    insecure: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "BORED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// CLI value, then file value, then the built-in default
fn seconds(cli: Option<u64>, file: Option<u64>, default: Duration) -> Duration {
    cli.or(file).map(Duration::from_secs).unwrap_or(default)
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => Ok(v),
        None => {
            error!("{} is not set", name);
            Err(anyhow!("missing required setting {}", name))
        }
    }
}

fn agent_options(cli: &Cli, file: &FileConfig) -> AgentOptions {
    let defaults = SessionConfig::default();
    AgentOptions {
        session: SessionConfig {
            connect_timeout: seconds(
                cli.connect_timeout,
                file.connect_timeout_secs,
                defaults.connect_timeout,
            ),
            keepalive_interval: seconds(
                cli.keepalive_interval,
                file.keepalive_interval_secs,
                defaults.keepalive_interval,
            ),
            keepalive_timeout: seconds(
                cli.keepalive_timeout,
                file.keepalive_timeout_secs,
                defaults.keepalive_timeout,
            ),
            reconnect_delay: seconds(
                cli.reconnect_delay,
                file.reconnect_delay_secs,
                defaults.reconnect_delay,
            ),
            max_reconnect_delay: seconds(
                cli.max_reconnect_delay,
                file.max_reconnect_delay_secs,
                defaults.max_reconnect_delay,
            ),
            ..defaults
        },
        ..AgentOptions::default()
    }
}

async fn run(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    let token = required(cli.token.clone(), "BORED_TOKEN")?;
    let namespace = required(cli.namespace.clone(), "NAMESPACE")?;

    let file = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config file");
            FileConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?
        }
        None => FileConfig::default(),
    };
    let options = agent_options(&cli, &file);
    options.validate().context("Invalid configuration")?;

    // Identity
    let store = KubeSecretStore::try_default()
        .await
        .context("Secret store unavailable")?;
    let mut manager = KeyPairManager::new(Arc::new(store));
    if let (Some(cert), Some(key)) = (&cli.signer_cert, &cli.signer_key) {
        let signer =
            CertificateSigner::from_files(cert, key).context("Failed to load certificate signer")?;
        info!(cert = %cert.display(), "Agent certificates will be CA-signed");
        manager = manager.with_signer(signer);
    }
    if let Some(dir) = &cli.keys_dir {
        manager = manager.with_keys_dir(dir);
    }
    let keys = manager
        .ensure_keys(&namespace)
        .await
        .context("Failed to obtain agent identity")?;

    // Control channel
    let max_frame_size = cli.max_frame_size.or(file.max_frame_size);
    let mut ws_config = WebSocketConfig::new(&cli.server, token)
        .context("Invalid server address")?
        .with_connect_timeout(options.session.connect_timeout);
    if let Some(size) = max_frame_size {
        ws_config = ws_config.with_max_frame_size(size);
    }
    if let Some(proxy) = cli.https_proxy.as_deref().filter(|p| !p.is_empty()) {
        let proxy = HttpConnectProxy::from_url(proxy).context("Invalid HTTPS_PROXY")?;
        info!(proxy = ?proxy.address(), "Using HTTP CONNECT proxy");
        ws_config = ws_config.with_proxy(proxy);
    }
    if cli.insecure {
        warn!("Server certificate verification disabled (insecure mode)");
        ws_config = ws_config.with_insecure_skip_verify();
    }
    info!(url = %ws_config.server_url, "Control channel endpoint");
    let channel_connector =
        WebSocketConnector::new(ws_config).context("Failed to configure control channel")?;

    // Destinations
    let local_tls = LocalTlsConfig {
        idp_public_key: cli.idp_public_key.clone(),
        ca_file: cli.ca_file.clone(),
    }
    .with_default_ca()
    .build()
    .context("Failed to configure TLS for destinations")?;
    let local_timeout = seconds(
        cli.local_connect_timeout,
        file.local_connect_timeout_secs,
        Duration::from_secs(10),
    );
    if local_timeout.is_zero() {
        return Err(anyhow!("Invalid configuration: local_connect_timeout must be greater than zero"));
    }
    let local_connector = TcpLocalConnector::new(local_timeout, local_tls);

    let allowlist_config = file.allowlist.clone().unwrap_or_else(AllowlistConfig::default);
    info!(
        networks = ?allowlist_config.networks,
        ports = ?allowlist_config.ports,
        hostnames = ?allowlist_config.hostnames,
        "Destination allowlist"
    );
    let policy = Allowlist::from_config(&allowlist_config).context("Invalid allowlist")?;

    let proxy = Arc::new(AgentProxy::new(
        options,
        Arc::new(channel_connector),
        Arc::new(local_connector),
        Arc::new(policy),
    ));
    proxy.init(keys)?;
    proxy
        .connect()
        .await
        .context("Failed to connect to the bored server")?;

    let reload = spawn_reload_handler(proxy.clone(), shutdown.clone());
    proxy.run_until_cancelled(shutdown).await;

    let result = match reload.await {
        Ok(result) => result,
        Err(e) => Err(anyhow!("SIGHUP handler failed: {}", e)),
    };
    // A reconnect racing the shutdown may have connected again
    proxy.disconnect().await;
    result
}

/// Cancel `token` on SIGTERM or SIGINT
fn spawn_shutdown_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
        token.cancel();
    });
    Ok(())
}

/// Start a clean generation on SIGHUP
///
/// Resolves with an error, after cancelling `shutdown`, when the server
/// rejects the agent during the reconnect.
fn spawn_reload_handler(
    proxy: Arc<AgentProxy>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<()>> {
    #[cfg(unix)]
    return tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("Failed to install SIGHUP handler: {}", e);
                return Ok(());
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = hangup.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                }
            }
            info!("Received SIGHUP, reconnecting");
            if let Err(e) = proxy.reconnect(&shutdown).await {
                shutdown.cancel();
                return Err(anyhow::Error::new(e).context("Reconnect after SIGHUP failed"));
            }
        }
    });
    #[cfg(not(unix))]
    {
        let _ = (proxy, shutdown);
        tokio::spawn(async { Ok(()) })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    info!(
        version = env!("GIT_TAG"),
        git_hash = env!("GIT_HASH"),
        build_time = env!("BUILD_TIME"),
        "bored agent starting"
    );

    let shutdown = CancellationToken::new();
    if let Err(e) = spawn_shutdown_handler(shutdown.clone()) {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli, shutdown).await {
        Ok(()) => {
            info!("bored agent stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
