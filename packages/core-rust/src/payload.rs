//! Request and response payloads carried inside bus events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::headers;

/// An inbound HTTP request as published onto the bus.
///
/// Immutable once published. Header names are stored lowercase; use
/// [`RequestPayload::header`] for lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub request_id: CorrelationId,
    pub method: String,
    pub path: String,
    /// First value of each query parameter.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// First value of each header.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes", default)]
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub local_addr: String,
    /// Milliseconds since the Unix epoch at which the request was received.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub tls: bool,
    /// Hop count carried in by the caller (`X-Hop-Count`), 0 at the first node.
    #[serde(default)]
    pub hop_count: u32,
}

impl RequestPayload {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated trail of relay nodes this request has passed through.
    #[must_use]
    pub fn visited_nodes(&self) -> Option<&str> {
        self.header(headers::VISITED_NODES).filter(|v| !v.is_empty())
    }

    /// Body as UTF-8 text, lossy.
    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A response destined for the listener that owns `request_id`.
///
/// Producers that only tag the event's `request_id` metadata may leave the
/// field out; consumers fall back to the metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<CorrelationId>,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes", default)]
    pub body: Vec<u8>,
    pub timestamp_ms: u64,
    /// Processing time in nanoseconds.
    #[serde(default)]
    pub duration_ns: u64,
}

impl ResponsePayload {
    /// Builds a `text/plain` response.
    #[must_use]
    pub fn text(request_id: CorrelationId, status_code: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            request_id: Some(request_id),
            status_code,
            headers,
            body: body.into().into_bytes(),
            timestamp_ms: crate::event::unix_millis(),
            duration_ns: 0,
        }
    }

    /// Adds a header, returning `self` for chaining.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, MsgPackCodec, PayloadCodec};

    fn request() -> RequestPayload {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("x-visited-nodes".to_string(), "NodeA,NodeB".to_string());
        RequestPayload {
            request_id: CorrelationId::new(),
            method: "POST".to_string(),
            path: "/api/test".to_string(),
            query: BTreeMap::new(),
            headers,
            body: b"hello".to_vec(),
            remote_addr: "127.0.0.1:5555".to_string(),
            local_addr: ":8080".to_string(),
            timestamp_ms: 1,
            tls: false,
            hop_count: 2,
        }
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = request();
        assert_eq!(req.header("Content-Type"), Some("text/plain"));
        assert_eq!(req.header("X-Missing"), None);
    }

    #[test]
    fn visited_nodes_reads_trail() {
        assert_eq!(request().visited_nodes(), Some("NodeA,NodeB"));
    }

    #[test]
    fn request_survives_both_codecs() {
        let req = request();
        let json: RequestPayload = JsonCodec.decode(&JsonCodec.encode(&req).unwrap()).unwrap();
        let packed: RequestPayload =
            MsgPackCodec.decode(&MsgPackCodec.encode(&req).unwrap()).unwrap();
        assert_eq!(json, req);
        assert_eq!(packed, req);
    }

    #[test]
    fn missing_hop_count_defaults_to_zero() {
        let req = request();
        let mut value = serde_json::to_value(&req).unwrap();
        value.as_object_mut().unwrap().remove("hop_count");
        let decoded: RequestPayload = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.hop_count, 0);
    }

    #[test]
    fn text_response_sets_content_type() {
        let id = CorrelationId::new();
        let resp = ResponsePayload::text(id, 200, "ok").with_header("X-Hop-Count", "3");
        assert_eq!(resp.request_id, Some(id));
        assert_eq!(resp.headers["Content-Type"], "text/plain");
        assert_eq!(resp.headers["X-Hop-Count"], "3");
        assert_eq!(resp.body, b"ok");
    }

    #[test]
    fn response_request_id_is_optional_on_the_wire() {
        let mut resp = ResponsePayload::text(CorrelationId::new(), 200, "ok");
        resp.request_id = None;

        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("request_id").is_none());
        let json: ResponsePayload = JsonCodec.decode(&JsonCodec.encode(&resp).unwrap()).unwrap();
        let packed: ResponsePayload =
            MsgPackCodec.decode(&MsgPackCodec.encode(&resp).unwrap()).unwrap();
        assert_eq!(json.request_id, None);
        assert_eq!(packed, resp);
    }
}
