//! Echo mode: answers each request with a description of itself.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use relaymesh_core::{
    event_types, metadata_keys, Codec, Event, EventPublisher, RequestPayload, ResponsePayload,
};
use tracing::warn;

use super::pool::EventHandler;
use super::router::RelayError;

/// Builds the echo answer for `request`.
#[must_use]
pub fn echo_response(request: &RequestPayload) -> ResponsePayload {
    let body = format!(
        "Echo: {} {}\n\nRequest ID: {}\nHeaders: {:?}\nBody: {}",
        request.method,
        request.path,
        request.request_id,
        request.headers,
        request.body_text()
    );
    ResponsePayload::text(request.request_id, 200, body)
}

/// Echo-mode request handler.
#[derive(Clone)]
pub struct EchoResponder {
    source: String,
    publisher: Arc<dyn EventPublisher>,
    codec: Codec,
}

impl EchoResponder {
    #[must_use]
    pub fn new(source: &str, publisher: Arc<dyn EventPublisher>, codec: Codec) -> Self {
        Self {
            source: source.to_string(),
            publisher,
            codec,
        }
    }

    /// Decodes `event` and publishes its echo.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the event cannot be decoded or the answer
    /// cannot be published.
    pub async fn respond(&self, event: &Event) -> Result<(), RelayError> {
        let started = Instant::now();
        let request: RequestPayload = event.decode_payload(&self.codec)?;
        let mut response = echo_response(&request);
        response.duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let answer = Event::new(event_types::HTTP_RESPONSE, &self.source, &response, &self.codec)?
            .with_metadata(metadata_keys::REQUEST_ID, request.request_id.to_string());
        self.publisher.publish(answer).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for EchoResponder {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn handle(&self, event: Event) {
        if let Err(err) = self.respond(&event).await {
            warn!(event_id = %event.id, error = %err, "Echo failed");
        }
    }
}
