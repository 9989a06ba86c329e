//! Node-level configuration: routes, hop ceiling, worker pool, timeouts.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relaymesh_core::Codec;

use crate::network::NetworkConfig;

/// What a node does with the requests its listeners publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeMode {
    /// Forward each request to the route's next hop and acknowledge locally.
    #[default]
    Relay,
    /// Answer each request with an echo of itself.
    Echo,
}

impl NodeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Echo => "echo",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" => Ok(Self::Relay),
            "echo" => Ok(Self::Echo),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// One listening point and where its traffic is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Listen address, e.g. `:8080` or `127.0.0.1:8080`.
    pub listen_addr: String,
    /// Base URL of the next hop, e.g. `http://node-b:8080`.
    pub next_hop: Option<String>,
}

/// Configuration errors, reported before any socket is bound.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no listen addresses configured")]
    NoRoutes,
    #[error("listen address {0} is configured twice")]
    DuplicateListenAddr(String),
    #[error("relay route on {listen_addr} has no next hop")]
    MissingNextHop { listen_addr: String },
    #[error("next hop {0} must be an http:// or https:// URL")]
    InvalidNextHop(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("unknown node mode {0:?} (expected \"relay\" or \"echo\")")]
    UnknownMode(String),
}

/// Full configuration of one relay node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity reported in relay headers and local acknowledgements.
    pub node_name: String,
    pub mode: NodeMode,
    /// Route table, one entry per listener. Immutable once the node starts.
    pub routes: Vec<RouteConfig>,
    /// Highest hop count that is still forwarded.
    pub max_hops: u32,
    /// Worker pool size. `None` means one worker per route.
    pub worker_count: Option<usize>,
    /// How long a listener waits for a response before sending the fallback.
    pub response_timeout: Duration,
    /// Timeout applied to each forward to a next hop.
    pub forward_timeout: Duration,
    /// Per-subscription queue capacity on the event bus.
    pub bus_capacity: usize,
    /// How long a publish waits on a full subscription queue.
    pub publish_timeout: Duration,
    /// Interval of the periodic stats log line.
    pub stats_interval: Duration,
    /// Optional address of the admin listener (`/health`, `/stats`).
    pub admin_addr: Option<String>,
    /// Payload codec used on the bus.
    pub codec: Codec,
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "relay-node".to_string(),
            mode: NodeMode::Relay,
            routes: Vec::new(),
            max_hops: 10,
            worker_count: None,
            response_timeout: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(10),
            bus_capacity: relaymesh_core::bus::DEFAULT_CHANNEL_CAPACITY,
            publish_timeout: relaymesh_core::bus::DEFAULT_PUBLISH_TIMEOUT,
            stats_interval: Duration::from_secs(30),
            admin_addr: None,
            codec: Codec::Json,
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Number of workers draining the request stream (at least 1).
    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.unwrap_or(self.routes.len()).max(1)
    }

    /// Checks the configuration for errors that would otherwise surface at runtime.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.listen_addr.as_str()) {
                return Err(ConfigError::DuplicateListenAddr(route.listen_addr.clone()));
            }
            match (&route.next_hop, self.mode) {
                (None, NodeMode::Relay) => {
                    return Err(ConfigError::MissingNextHop {
                        listen_addr: route.listen_addr.clone(),
                    });
                }
                (Some(hop), _) if !is_http_url(hop) => {
                    return Err(ConfigError::InvalidNextHop(hop.clone()));
                }
                _ => {}
            }
        }

        if self.response_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("response timeout"));
        }
        if self.forward_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("forward timeout"));
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("stats interval"));
        }
        Ok(())
    }
}

/// Pairs listen addresses with next hops positionally.
///
/// A listen address without a positional next hop (or with an empty one)
/// falls back to `default_next_hop`.
#[must_use]
pub fn routes_from_lists(
    listen_addrs: &[String],
    next_hops: &[String],
    default_next_hop: Option<&str>,
) -> Vec<RouteConfig> {
    listen_addrs
        .iter()
        .enumerate()
        .map(|(i, listen)| {
            let next_hop = next_hops
                .get(i)
                .map(|h| h.trim())
                .filter(|h| !h.is_empty())
                .or(default_next_hop)
                .map(|h| h.trim_end_matches('/').to_string());
            RouteConfig {
                listen_addr: listen.trim().to_string(),
                next_hop,
            }
        })
        .collect()
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
#[must_use]
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Turns a listen address into a bindable socket address (`:8080` → `0.0.0.0:8080`).
#[must_use]
pub fn bind_address(listen_addr: &str) -> String {
    if listen_addr.starts_with(':') {
        format!("0.0.0.0{listen_addr}")
    } else {
        listen_addr.to_string()
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
