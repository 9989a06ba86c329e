//! Outbound forwarding to the next hop.

use std::time::Duration;

use async_trait::async_trait;
use relaymesh_core::{headers, CorrelationId, RequestPayload};
use reqwest::Client;

/// A request ready to be sent to a next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub url: String,
    /// Headers to send, in order. Relay headers come last and win.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub hop: u32,
    /// Correlation ID of the request at this node.
    pub request_id: CorrelationId,
}

impl ForwardRequest {
    /// Builds the forward of `payload` to `next_hop` as hop `hop`.
    ///
    /// The original path is appended to the next hop's base URL. Headers are
    /// copied except hop-by-hop and relay headers, which are rewritten:
    /// `X-Hop-Count`, `X-Relay-Node`, `X-Visited-Nodes` (with `node`
    /// appended) and `X-Original-Request-ID`. The body is prefixed with
    /// `[<node>→hop<n>] `.
    #[must_use]
    pub fn build(next_hop: &str, payload: &RequestPayload, hop: u32, node: &str) -> Self {
        let url = format!("{}{}", next_hop.trim_end_matches('/'), payload.path);

        let mut forwarded: Vec<(String, String)> = payload
            .headers
            .iter()
            .filter(|(name, _)| !headers::is_hop_by_hop(name) && !is_relay_header(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        forwarded.push((headers::HOP_COUNT.to_string(), hop.to_string()));
        forwarded.push((headers::RELAY_NODE.to_string(), node.to_string()));
        forwarded.push((
            headers::VISITED_NODES.to_string(),
            headers::append_visited(payload.visited_nodes(), node),
        ));
        forwarded.push((
            headers::ORIGINAL_REQUEST_ID.to_string(),
            payload.request_id.to_string(),
        ));

        let mut body = format!("[{node}→hop{hop}] ").into_bytes();
        body.extend_from_slice(&payload.body);

        Self {
            url,
            headers: forwarded,
            body,
            hop,
            request_id: payload.request_id,
        }
    }

    /// Case-insensitive lookup among the outgoing headers.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn is_relay_header(name: &str) -> bool {
    [
        headers::HOP_COUNT,
        headers::RELAY_NODE,
        headers::VISITED_NODES,
        headers::ORIGINAL_REQUEST_ID,
    ]
    .iter()
    .any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid forward request to {url}: {reason}")]
    InvalidRequest { url: String, reason: String },
    #[error("forward to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("forward to {url} timed out")]
    Timeout { url: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

/// Sends forward requests. Implementations must be safe to call from many
/// tasks at once.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<(), ForwardError>;
}

/// [`Forwarder`] over a shared, connection-pooling HTTP client.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    /// Builds a forwarder whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed (e.g. the
    /// TLS backend fails to initialize).
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: ForwardRequest) -> Result<(), ForwardError> {
        let url = request.url;
        let mut builder = self.client.post(&url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout { url: url.clone() }
            } else if e.is_builder() {
                ForwardError::InvalidRequest {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            } else {
                ForwardError::Transport {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        // Drain the body so the connection returns to the pool.
        let _ = response.bytes().await;
        if status.is_success() {
            Ok(())
        } else {
            Err(ForwardError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}
