//! Listener-level network configuration.

use std::time::Duration;

/// Settings shared by every HTTP listener a node opens.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Largest request body a listener will buffer, in bytes.
    pub max_body_bytes: usize,
    /// How long shutdown waits for in-flight requests before giving up.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 4 * 1024 * 1024, // 4 MiB
            drain_timeout: Duration::from_secs(30),
        }
    }
}
