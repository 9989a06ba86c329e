//! HTTP ⇄ event bus bridge: listener adapters, the correlation registry, and
//! the response emitter.

pub mod adapter;
pub mod correlator;
pub mod emitter;
pub mod reply;

pub use adapter::{InboundRequest, ListenerAdapter, RequestState};
pub use correlator::{
    CompletionError, CorrelatorError, CorrelatorStats, PendingResponse, ReplyReceiver,
    RequestCorrelator, ResolveError,
};
pub use emitter::{EmitError, EmitterStats, ResponseEmitter, EMITTER_ID};
pub use reply::HttpReply;
