//! Event envelope and subscription filters.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{CodecError, PayloadCodec};

/// Event type names used on the bus.
pub mod event_types {
    /// An inbound HTTP request published by a listener.
    pub const HTTP_REQUEST: &str = "net.http.request";
    /// A response addressed to a waiting listener.
    pub const HTTP_RESPONSE: &str = "net.http.response";
}

/// Well-known metadata keys.
pub mod metadata_keys {
    /// Identity of the listener adapter that received the request.
    pub const ADAPTER_ID: &str = "adapter_id";
    /// Correlation ID of the request the event belongs to.
    pub const REQUEST_ID: &str = "request_id";
    /// Hop count the request arrived with.
    pub const HOP_COUNT: &str = "hop_count";
}

/// Milliseconds since the Unix epoch, saturating to 0 on a pre-epoch clock.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A typed, encoded message moving across the bus.
///
/// The payload is opaque bytes tagged with the codec's content type; the
/// metadata map carries routing hints that consumers read without decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub source: String,
    pub content_type: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Event {
    /// Encodes `payload` with `codec` and wraps it in a new envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the payload cannot be encoded.
    pub fn new<T, C>(
        event_type: &str,
        source: &str,
        payload: &T,
        codec: &C,
    ) -> Result<Self, CodecError>
    where
        T: Serialize,
        C: PayloadCodec,
    {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            content_type: codec.content_type().to_string(),
            timestamp_ms: unix_millis(),
            metadata: BTreeMap::new(),
            payload: codec.encode(payload)?,
        })
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Reads a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ContentType`] if the envelope was encoded with a
    /// different codec, or [`CodecError::Decode`] if the bytes are malformed.
    pub fn decode_payload<T, C>(&self, codec: &C) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
        C: PayloadCodec,
    {
        let expected = codec.content_type();
        if self.content_type != expected {
            return Err(CodecError::ContentType {
                expected,
                actual: self.content_type.clone(),
            });
        }
        codec.decode(&self.payload)
    }
}

/// Selects which events a subscription receives.
///
/// An empty type list matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub types: Vec<String>,
}

impl EventFilter {
    /// Matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches events of the given types.
    #[must_use]
    pub fn types(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| *t == event.event_type)
    }
}
