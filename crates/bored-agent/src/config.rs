//! Agent tunables and the optional YAML configuration file

use bored_proto::INITIAL_WINDOW;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Size of each local read turned into a `Data` frame
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Control channel timing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on establishing the control channel
    pub connect_timeout: Duration,

    /// Interval between keepalive pings
    pub keepalive_interval: Duration,

    /// How long to wait for the matching pong
    pub keepalive_timeout: Duration,

    /// First reconnect delay, doubled on every failed attempt
    pub reconnect_delay: Duration,

    /// Upper bound for the reconnect delay
    pub max_reconnect_delay: Duration,

    /// How long a generation waits for its relays to finish on teardown
    pub drain_timeout: Duration,

    /// Capacity of the queue in front of the socket writer
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            outbound_queue: 1024,
        }
    }
}

impl SessionConfig {
    /// Reject timings the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero("keepalive_interval", self.keepalive_interval)?;
        non_zero("keepalive_timeout", self.keepalive_timeout)?;
        non_zero("reconnect_delay", self.reconnect_delay)?;
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(ConfigError::Invalid {
                name: "max_reconnect_delay",
                reason: format!(
                    "{:?} is below reconnect_delay {:?}",
                    self.max_reconnect_delay, self.reconnect_delay
                ),
            });
        }
        Ok(())
    }
}

/// Options for [`crate::AgentProxy`]
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub session: SessionConfig,

    /// Per-stream flow control window, in bytes, for each direction
    pub window_size: u32,

    /// Local read size
    pub read_chunk_size: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            window_size: INITIAL_WINDOW,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

/// Destinations the agent may open
///
/// Entries in `hostnames` starting with `.` match any name ending with them;
/// other entries match exactly.
impl AgentOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.window_size == 0 {
            return Err(ConfigError::Invalid {
                name: "window_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "read_chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllowlistConfig {
    pub networks: Vec<String>,
    pub ports: Vec<u16>,
    pub hostnames: Vec<String>,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            networks: [
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.0.0/16",
                "127.0.0.0/8",
                "::1/128",
                "fc00::/7",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ports: Vec::new(),
            hostnames: ["localhost", ".svc", ".cluster.local"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Contents of the `--config` YAML file
///
/// ```yaml
/// allowlist:
///   networks: ["10.0.0.0/8"]
///   ports: [443, 6443]
///   hostnames: [".svc"]
/// keepalive_interval_secs: 30
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub allowlist: Option<AllowlistConfig>,
    pub keepalive_interval_secs: Option<u64>,
    pub keepalive_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub local_connect_timeout_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
    pub max_reconnect_delay_secs: Option<u64>,
    pub max_frame_size: Option<usize>,
}

impl FileConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }
}
