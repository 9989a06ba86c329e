//! Admin endpoints: health, liveness, readiness, and stats.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AdminState;
use crate::network::HealthState;
use crate::stats::NodeStats;

/// Detailed health as JSON. Always 200; `state` tells whether the node is
/// serving, starting, or draining.
pub async fn health_handler(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "node": state.stats.node_name(),
        "in_flight": state.shutdown.in_flight_count(),
        "pending": state.stats.pending_requests(),
        "uptime_secs": state.stats.uptime().as_secs(),
    }))
}

/// Liveness probe: 200 while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only in the `Ready` state.
pub async fn readiness_handler(State(state): State<AdminState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Node counters as JSON.
pub async fn stats_handler(State(state): State<AdminState>) -> Json<NodeStats> {
    Json(state.stats.snapshot())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relaymesh_core::{Codec, InMemoryEventBus};

    use super::*;
    use crate::bridge::{RequestCorrelator, ResponseEmitter};
    use crate::config::{NodeMode, RouteConfig};
    use crate::network::ShutdownController;
    use crate::relay::RouteTable;
    use crate::stats::StatsCollector;

    fn test_state() -> AdminState {
        let table = Arc::new(
            RouteTable::from_configs(&[RouteConfig {
                listen_addr: ":8080".to_string(),
                next_hop: Some("http://b".to_string()),
            }])
            .unwrap(),
        );
        let correlator = Arc::new(RequestCorrelator::new());
        let emitter = Arc::new(ResponseEmitter::new(Arc::clone(&correlator), Codec::Json));
        AdminState {
            shutdown: Arc::new(ShutdownController::new()),
            stats: Arc::new(StatsCollector::new(
                "NodeA",
                NodeMode::Relay,
                table,
                correlator,
                emitter,
                Arc::new(InMemoryEventBus::new("test")),
            )),
        }
    }

    #[tokio::test]
    async fn health_handler_reports_state_and_node() {
        let state = test_state();
        state.shutdown.set_ready();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "ready");
        assert_eq!(json["node"], "NodeA");
        assert_eq!(json["in_flight"], 0);
        assert_eq!(json["pending"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_draining() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "draining");
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_lifecycle() {
        let state = test_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn stats_handler_returns_snapshot() {
        let state = test_state();
        let stats = stats_handler(State(state)).await.0;
        assert_eq!(stats.node, "NodeA");
        assert_eq!(stats.routes.len(), 1);
        assert_eq!(stats.totals.received, 0);
    }
}
