//! `relaymesh` server: HTTP listeners bridged onto an in-process event bus,
//! hop-counted relaying between nodes, and the node lifecycle around them.

pub mod bridge;
pub mod config;
pub mod network;
pub mod node;
pub mod relay;
pub mod stats;

pub use config::{NodeConfig, NodeMode, RouteConfig};
pub use node::RelayNode;
