//! The HTTP answer written back to a waiting caller.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use relaymesh_core::ResponsePayload;

/// Body of the reply sent when no response arrives in time.
pub const FALLBACK_BODY: &str = "Request processed";

/// Body of the reply sent when a request could not be put on the bus.
pub const PUBLISH_FAILED_BODY: &str = "Failed to process request";

/// Status, headers and body of one HTTP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpReply {
    /// A `text/plain` reply.
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            status,
            headers,
            body: Bytes::from(body.into()),
        }
    }

    /// `200 Request processed`, sent when the response wait times out.
    #[must_use]
    pub fn fallback() -> Self {
        Self::text(200, FALLBACK_BODY)
    }

    /// `503 Failed to process request`, sent when publishing fails.
    #[must_use]
    pub fn publish_failed() -> Self {
        Self::text(503, PUBLISH_FAILED_BODY)
    }

    #[must_use]
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::text(500, reason)
    }

    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl From<ResponsePayload> for HttpReply {
    fn from(payload: ResponsePayload) -> Self {
        Self {
            status: payload.status_code,
            headers: payload.headers,
            body: Bytes::from(payload.body),
        }
    }
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            // Unrepresentable headers are skipped rather than failing the reply.
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(header = %name, "Skipping invalid response header");
                continue;
            };
            headers.insert(name, value);
        }
        response
    }
}
