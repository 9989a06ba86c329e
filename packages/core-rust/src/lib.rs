//! `relaymesh` core: correlation IDs, event envelopes, request/response
//! payloads, payload codecs, and the event bus boundary.

pub mod bus;
pub mod codec;
pub mod correlation;
pub mod event;
pub mod headers;
pub mod payload;

pub use bus::{
    EventPublisher, EventSubscriber, InMemoryEventBus, PublishError, SubscribeError, Subscription,
};
pub use codec::{Codec, CodecError, JsonCodec, MsgPackCodec, PayloadCodec};
pub use correlation::CorrelationId;
pub use event::{event_types, metadata_keys, unix_millis, Event, EventFilter};
pub use payload::{RequestPayload, ResponsePayload};
