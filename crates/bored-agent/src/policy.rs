use crate::config::AllowlistConfig;
use crate::AgentError;
use bored_transport::split_host_port;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

/// Decides whether the broker may open a stream to a destination
#[cfg_attr(test, mockall::automock)]
pub trait DestinationPolicy: Send + Sync {
    /// `destination` is in `host:port` or `[v6]:port` form
    fn is_allowed(&self, destination: &str) -> bool;
}

/// Permits every destination
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl DestinationPolicy for AllowAll {
    fn is_allowed(&self, _destination: &str) -> bool {
        true
    }
}

/// Network, hostname and port allowlist
///
/// An allowlist without networks and hostnames permits every host; otherwise
/// IP hosts must fall in one of the networks and names must match one of the
/// hostname patterns. An empty port list permits every port.
#[derive(Debug, Clone)]
pub struct Allowlist {
    networks: Vec<IpNetwork>,
    ports: Vec<u16>,
    hostnames: Vec<String>,
}

impl Allowlist {
    /// Create an allowlist from CIDR strings, ports and hostname patterns
    pub fn new(
        networks: Vec<String>,
        ports: Vec<u16>,
        hostnames: Vec<String>,
    ) -> Result<Self, AgentError> {
        let mut parsed_networks = Vec::with_capacity(networks.len());

        for network_str in networks {
            let network = IpNetwork::from_str(&network_str).map_err(|e| {
                AgentError::InvalidAllowlist(format!(
                    "Invalid CIDR notation '{}': {}",
                    network_str, e
                ))
            })?;
            parsed_networks.push(network);
        }

        let mut patterns = Vec::with_capacity(hostnames.len());
        for hostname in hostnames {
            let pattern = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
            if pattern.is_empty() || pattern == "." {
                return Err(AgentError::InvalidAllowlist(format!(
                    "Invalid hostname pattern '{}'",
                    hostname
                )));
            }
            patterns.push(pattern);
        }

        Ok(Self {
            networks: parsed_networks,
            ports,
            hostnames: patterns,
        })
    }

    pub fn from_config(config: &AllowlistConfig) -> Result<Self, AgentError> {
        Self::new(
            config.networks.clone(),
            config.ports.clone(),
            config.hostnames.clone(),
        )
    }

    fn is_host_allowed(&self, host: &str) -> bool {
        if self.networks.is_empty() && self.hostnames.is_empty() {
            return true;
        }

        match IpAddr::from_str(host) {
            Ok(ip) => self.networks.iter().any(|network| network.contains(ip)),
            Err(_) => self.is_hostname_allowed(host),
        }
    }

    fn is_hostname_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        self.hostnames.iter().any(|pattern| {
            if pattern.starts_with('.') {
                host.ends_with(pattern.as_str())
            } else {
                host == *pattern
            }
        })
    }

    fn is_port_allowed(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        let config = AllowlistConfig::default();
        Self {
            networks: config
                .networks
                .iter()
                .filter_map(|n| IpNetwork::from_str(n).ok())
                .collect(),
            ports: config.ports,
            hostnames: config.hostnames,
        }
    }
}

impl DestinationPolicy for Allowlist {
    fn is_allowed(&self, destination: &str) -> bool {
        match split_host_port(destination) {
            Some((host, port)) => self.is_host_allowed(host) && self.is_port_allowed(port),
            None => {
                tracing::warn!(destination, "Failed to parse destination");
                false
            }
        }
    }
}
