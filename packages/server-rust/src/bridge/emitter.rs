//! Response emitter: consumes response events and completes the matching
//! pending requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relaymesh_core::{
    metadata_keys, Codec, CodecError, CorrelationId, Event, ResponsePayload, Subscription,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::correlator::{RequestCorrelator, ResolveError};

/// Identity of the emitter in logs.
pub const EMITTER_ID: &str = "http-client-emitter";

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("undecodable response event {event_id}: {source}")]
    Decode {
        event_id: uuid::Uuid,
        #[source]
        source: CodecError,
    },
    #[error("response event {event_id} carries no request id")]
    MissingRequestId { event_id: uuid::Uuid },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    pub delivered: u64,
    pub unmatched: u64,
    pub decode_errors: u64,
}

/// Routes response events back to the listeners waiting on them.
#[derive(Debug)]
pub struct ResponseEmitter {
    correlator: Arc<RequestCorrelator>,
    codec: Codec,
    delivered: AtomicU64,
    unmatched: AtomicU64,
    decode_errors: AtomicU64,
}

impl ResponseEmitter {
    #[must_use]
    pub fn new(correlator: Arc<RequestCorrelator>, codec: Codec) -> Self {
        Self {
            correlator,
            codec,
            delivered: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Decodes one response event and resolves its pending request.
    ///
    /// # Errors
    ///
    /// - [`EmitError::Decode`] if the payload is not a response.
    /// - [`EmitError::MissingRequestId`] if neither the payload nor the
    ///   `request_id` metadata names a valid correlation ID.
    /// - [`EmitError::Resolve`] if nobody is waiting (late, duplicate, or
    ///   stray response). Non-fatal; the response is dropped.
    pub fn emit(&self, event: &Event) -> Result<CorrelationId, EmitError> {
        let payload: ResponsePayload = match event.decode_payload(&self.codec) {
            Ok(payload) => payload,
            Err(source) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(EmitError::Decode {
                    event_id: event.id,
                    source,
                });
            }
        };
        let Some(id) = payload.request_id.or_else(|| {
            event
                .metadata(metadata_keys::REQUEST_ID)
                .and_then(|v| CorrelationId::parse(v).ok())
        }) else {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            return Err(EmitError::MissingRequestId { event_id: event.id });
        };

        match self.correlator.resolve(id, payload.into()) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(err) => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// Drains `subscription` until it is closed and empty.
    pub async fn run(self: Arc<Self>, subscription: Arc<Subscription>) {
        info!(emitter = EMITTER_ID, subscription = subscription.id(), "Response emitter started");
        while let Some(event) = subscription.recv().await {
            match self.emit(&event) {
                Ok(id) => debug!(correlation_id = %id, "Response delivered"),
                Err(EmitError::Resolve(ResolveError::NotFound(id))) => {
                    warn!(correlation_id = %id, "No pending request for response");
                }
                Err(EmitError::Resolve(err)) => debug!(error = %err, "Response dropped"),
                Err(err) => warn!(error = %err, "Response dropped"),
            }
        }
        info!(emitter = EMITTER_ID, "Response emitter stopped");
    }

    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}
