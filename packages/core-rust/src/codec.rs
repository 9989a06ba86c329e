//! Payload codecs used to place typed payloads inside event envelopes.
//!
//! The bus itself only moves bytes; encoding is a separate concern so a node
//! can switch between JSON (human-readable, the default) and named `MsgPack`
//! (compact) without touching the components that build events.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors produced while encoding or decoding an event payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("payload content type {actual} does not match codec {expected}")]
    ContentType {
        expected: &'static str,
        actual: String,
    },
}

/// Encodes values to bytes and back.
pub trait PayloadCodec: Send + Sync {
    /// MIME type recorded on every envelope built with this codec.
    fn content_type(&self) -> &'static str;

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be serialized.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid encoding of `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// `MsgPack` codec using named maps (`rmp_serde::to_vec_named`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl PayloadCodec for MsgPackCodec {
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Runtime-selectable codec.
///
/// Components hold a `Codec` rather than being generic over
/// [`PayloadCodec`], which keeps node assembly free of type parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

impl PayloadCodec for Codec {
    fn content_type(&self) -> &'static str {
        match self {
            Self::Json => JsonCodec.content_type(),
            Self::MsgPack => MsgPackCodec.content_type(),
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => JsonCodec.encode(value),
            Self::MsgPack => MsgPackCodec.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => JsonCodec.decode(bytes),
            Self::MsgPack => MsgPackCodec.decode(bytes),
        }
    }
}
