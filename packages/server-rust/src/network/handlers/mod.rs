//! Axum handlers: the ingress fallback every listener serves, and the admin
//! endpoints (`/health*`, `/stats`).

pub mod health;
pub mod ingress;

pub use health::{health_handler, liveness_handler, readiness_handler, stats_handler};
pub use ingress::{decode_request, ingress_handler, IngressError};

use std::sync::Arc;

use super::ShutdownController;
use crate::bridge::ListenerAdapter;
use crate::stats::StatsCollector;

/// State of one ingress listener.
#[derive(Clone)]
pub struct IngressState {
    pub adapter: Arc<ListenerAdapter>,
    /// Tracks in-flight requests for the shutdown drain.
    pub shutdown: Arc<ShutdownController>,
}

/// State of the admin listener.
#[derive(Clone)]
pub struct AdminState {
    pub shutdown: Arc<ShutdownController>,
    pub stats: Arc<StatsCollector>,
}
