//! Listener adapter: turns one inbound HTTP request into a published event
//! and waits for the correlated response.
//!
//! Per-request state machine:
//!
//! ```text
//! Received --publish ok--> Published --response--> Completed
//!     |                        |
//!     +--publish failed--> Failed   +--timeout--> TimedOut (fallback written)
//! ```
//!
//! A response that loses the race against the timeout is discarded by the
//! correlator; whichever completion won is what the caller receives.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relaymesh_core::{
    event_types, headers, metadata_keys, unix_millis, Codec, CorrelationId, Event,
    EventPublisher, RequestPayload,
};
use tracing::{debug, info_span, warn, Instrument};

use super::correlator::RequestCorrelator;
use super::reply::HttpReply;

/// Raw request as decoded from the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Lowercase header names, first value only.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub tls: bool,
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Published,
    Completed,
    TimedOut,
    Failed,
}

/// Bridges one HTTP listener onto the event bus.
pub struct ListenerAdapter {
    id: String,
    listen_addr: String,
    correlator: Arc<RequestCorrelator>,
    publisher: Arc<dyn EventPublisher>,
    codec: Codec,
    response_timeout: Duration,
}

impl ListenerAdapter {
    #[must_use]
    pub fn new(
        listen_addr: &str,
        correlator: Arc<RequestCorrelator>,
        publisher: Arc<dyn EventPublisher>,
        codec: Codec,
        response_timeout: Duration,
    ) -> Self {
        Self {
            id: Self::adapter_id(listen_addr),
            listen_addr: listen_addr.to_string(),
            correlator,
            publisher,
            codec,
            response_timeout,
        }
    }

    /// Adapter identity for a listen address, as stamped on published events.
    #[must_use]
    pub fn adapter_id(listen_addr: &str) -> String {
        format!("http-server-{listen_addr}")
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Publishes `request` and waits for its response.
    ///
    /// Always returns a reply: the correlated response, the fallback on
    /// timeout, or an error reply if the request never reached the bus.
    pub async fn handle(&self, request: InboundRequest) -> HttpReply {
        let id = CorrelationId::new();
        let span = info_span!("request", correlation_id = %id, adapter = %self.id);
        self.handle_with_id(id, request).instrument(span).await
    }

    async fn handle_with_id(&self, id: CorrelationId, request: InboundRequest) -> HttpReply {
        let (handle, mut rx) = match self.correlator.register(id) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "Could not register request");
                return HttpReply::internal_error(super::reply::PUBLISH_FAILED_BODY);
            }
        };
        let mut state = RequestState::Received;

        let event = match self.build_event(id, request) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Could not encode request payload");
                self.correlator.unregister(id);
                transition(&mut state, RequestState::Failed);
                return HttpReply::internal_error(super::reply::PUBLISH_FAILED_BODY);
            }
        };

        if let Err(err) = self.publisher.publish(event).await {
            warn!(error = %err, "Failed to publish request event");
            self.correlator.unregister(id);
            transition(&mut state, RequestState::Failed);
            return HttpReply::publish_failed();
        }
        transition(&mut state, RequestState::Published);

        match tokio::time::timeout(self.response_timeout, &mut rx).await {
            Ok(Ok(reply)) => {
                transition(&mut state, RequestState::Completed);
                reply
            }
            Ok(Err(_)) => {
                // The handle is held here, so the sender can only vanish after a send.
                transition(&mut state, RequestState::Failed);
                HttpReply::internal_error(super::reply::PUBLISH_FAILED_BODY)
            }
            Err(_) => {
                transition(&mut state, RequestState::TimedOut);
                self.correlator.expire(id);
                if let Err(err) = handle.complete(HttpReply::fallback()) {
                    debug!(error = %err, "Response arrived during timeout handling");
                }
                // Whichever completion won has been (or is being) sent.
                rx.await.unwrap_or_else(|_| HttpReply::fallback())
            }
        }
    }

    fn build_event(
        &self,
        id: CorrelationId,
        request: InboundRequest,
    ) -> Result<Event, relaymesh_core::CodecError> {
        let hop_count = headers::parse_hop_count(
            request
                .headers
                .get(&headers::HOP_COUNT.to_ascii_lowercase())
                .map(String::as_str),
        );
        let payload = RequestPayload {
            request_id: id,
            method: request.method,
            path: request.path,
            query: request.query,
            headers: request.headers,
            body: request.body,
            remote_addr: request.remote_addr,
            local_addr: self.listen_addr.clone(),
            timestamp_ms: unix_millis(),
            tls: request.tls,
            hop_count,
        };

        Ok(
            Event::new(event_types::HTTP_REQUEST, &self.id, &payload, &self.codec)?
                .with_metadata(metadata_keys::ADAPTER_ID, self.id.clone())
                .with_metadata(metadata_keys::REQUEST_ID, id.to_string())
                .with_metadata(metadata_keys::HOP_COUNT, hop_count.to_string()),
        )
    }
}

impl std::fmt::Debug for ListenerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerAdapter")
            .field("id", &self.id)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

fn transition(state: &mut RequestState, next: RequestState) {
    debug!(from = ?*state, to = ?next, "Request state");
    *state = next;
}
