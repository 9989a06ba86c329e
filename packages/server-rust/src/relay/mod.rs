//! Relay pipeline: route table, loop guard, forwarding, and the worker pool
//! that drives it.

pub mod echo;
pub mod forwarder;
pub mod guard;
pub mod pool;
pub mod route;
pub mod router;

pub use echo::{echo_response, EchoResponder};
pub use forwarder::{ForwardError, ForwardRequest, Forwarder, HttpForwarder};
pub use guard::{HopDecision, LoopGuard};
pub use pool::{EventHandler, ForwardWorkerPool};
pub use route::{CounterSnapshot, Route, RouteCounters, RouteTable};
pub use router::{ForwardReport, RelayError, RelayRouter, RouteOutcome};
