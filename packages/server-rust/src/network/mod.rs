//! HTTP listeners, admin endpoints, middleware, and shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::{AdminState, IngressState};
pub use module::{build_admin_router, build_ingress_router, ListenerModule};
pub use shutdown::*;
