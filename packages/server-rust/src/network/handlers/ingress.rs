//! Ingress handler: decodes any HTTP request and hands it to the listener
//! adapter. Every method and path is accepted.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, FromRequest, Query, Request, State};
use axum::http::StatusCode;
use tracing::warn;

use super::IngressState;
use crate::bridge::{HttpReply, InboundRequest};

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("failed to read request body: {0}")]
    Body(#[from] BytesRejection),
    #[error("header {name} is not valid UTF-8")]
    Header { name: String },
    #[error("malformed query string: {0}")]
    Query(String),
}

impl IngressError {
    /// `413` for a body over the listener's limit, `400` otherwise.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Body(rejection) => rejection.status(),
            Self::Header { .. } | Self::Query(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Fallback handler for every ingress route.
pub async fn ingress_handler(State(state): State<IngressState>, request: Request) -> HttpReply {
    let _in_flight = state.shutdown.in_flight_guard();

    match decode_request(request).await {
        Ok(inbound) => state.adapter.handle(inbound).await,
        Err(err) => {
            warn!(adapter = state.adapter.id(), error = %err, "Rejecting undecodable request");
            HttpReply::text(err.status().as_u16(), err.to_string())
        }
    }
}

/// Converts an axum request into an [`InboundRequest`].
///
/// Header names are lowercased and only the first value of a repeated
/// header or query parameter is kept. The body is buffered up to the
/// `DefaultBodyLimit` installed on the router (axum's 2 MB default without one).
///
/// # Errors
///
/// Returns [`IngressError`] if the body exceeds the limit or cannot be read,
/// a header value is not UTF-8, or the query string is malformed.
pub async fn decode_request(request: Request<Body>) -> Result<InboundRequest, IngressError> {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        let value = value.to_str().map_err(|_| IngressError::Header {
            name: name.as_str().to_string(),
        })?;
        headers
            .entry(name.as_str().to_string())
            .or_insert_with(|| value.to_string());
    }

    let mut query = BTreeMap::new();
    if parts.uri.query().is_some() {
        let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
            .map_err(|e| IngressError::Query(e.body_text()))?;
        for (key, value) in pairs {
            query.entry(key).or_insert(value);
        }
    }

    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let body = Bytes::from_request(Request::from_parts(parts, body), &()).await?;

    Ok(InboundRequest {
        method,
        path,
        query,
        headers,
        body: body.to_vec(),
        remote_addr,
        tls: false,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{self, HeaderValue, Method};

    use super::*;

    #[tokio::test]
    async fn decodes_method_path_query_headers_body() {
        let mut request = http::Request::builder()
            .method(Method::PATCH)
            .uri("/api/items?id=7&tag=a&tag=b&name=hello%20world")
            .header("X-Hop-Count", "2")
            .header("Accept", "text/plain")
            .header("Accept", "application/json")
            .body(Body::from("payload"))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));

        let inbound = decode_request(request).await.unwrap();

        assert_eq!(inbound.method, "PATCH");
        assert_eq!(inbound.path, "/api/items");
        assert_eq!(inbound.query["id"], "7");
        assert_eq!(inbound.query["tag"], "a");
        assert_eq!(inbound.query["name"], "hello world");
        assert_eq!(inbound.headers["x-hop-count"], "2");
        assert_eq!(inbound.headers["accept"], "text/plain");
        assert_eq!(inbound.body, b"payload");
        assert_eq!(inbound.remote_addr, "127.0.0.1:4242");
        assert!(!inbound.tls);
    }

    #[tokio::test]
    async fn missing_connect_info_leaves_remote_empty() {
        let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let inbound = decode_request(request).await.unwrap();
        assert_eq!(inbound.remote_addr, "");
        assert!(inbound.query.is_empty());
        assert!(inbound.body.is_empty());
    }

    #[tokio::test]
    async fn body_over_default_limit_maps_to_413() {
        let request = http::Request::builder()
            .uri("/big")
            .body(Body::from(vec![0u8; 2 * 1024 * 1024 + 1]))
            .unwrap();
        let err = decode_request(request).await.unwrap_err();
        assert!(matches!(err, IngressError::Body(_)));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn non_utf8_header_is_rejected() {
        let mut request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        request.headers_mut().insert(
            "x-binary",
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        let err = decode_request(request).await.unwrap_err();
        assert!(matches!(err, IngressError::Header { .. }));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
