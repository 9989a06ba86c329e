//! Node statistics: snapshots for `/stats` and the periodic stats log.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relaymesh_core::InMemoryEventBus;
use serde::Serialize;
use tracing::info;

use crate::bridge::{CorrelatorStats, EmitterStats, RequestCorrelator, ResponseEmitter};
use crate::config::NodeMode;
use crate::relay::{CounterSnapshot, RouteTable};

#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub adapter_id: String,
    pub listen_addr: String,
    pub next_hop: Option<String>,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub rejected: u64,
    pub subscribers: usize,
}

/// Everything `/stats` reports.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node: String,
    pub mode: &'static str,
    pub uptime_secs: u64,
    pub totals: CounterSnapshot,
    pub routes: Vec<RouteStats>,
    pub correlator: CorrelatorStats,
    pub emitter: EmitterStats,
    pub bus: BusStats,
}

/// Collects [`NodeStats`] from the node's shared components.
#[derive(Debug)]
pub struct StatsCollector {
    node_name: String,
    mode: NodeMode,
    table: Arc<RouteTable>,
    correlator: Arc<RequestCorrelator>,
    emitter: Arc<ResponseEmitter>,
    bus: Arc<InMemoryEventBus>,
    started: Instant,
}

impl StatsCollector {
    #[must_use]
    pub fn new(
        node_name: &str,
        mode: NodeMode,
        table: Arc<RouteTable>,
        correlator: Arc<RequestCorrelator>,
        emitter: Arc<ResponseEmitter>,
        bus: Arc<InMemoryEventBus>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            mode,
            table,
            correlator,
            emitter,
            bus,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeStats {
        let routes = self
            .table
            .routes()
            .iter()
            .map(|route| RouteStats {
                adapter_id: route.adapter_id().to_string(),
                listen_addr: route.listen_addr().to_string(),
                next_hop: route.next_hop().map(ToString::to_string),
                counters: route.snapshot(),
            })
            .collect();

        NodeStats {
            node: self.node_name.clone(),
            mode: self.mode.as_str(),
            uptime_secs: self.uptime().as_secs(),
            totals: self.table.totals(),
            routes,
            correlator: self.correlator.stats(),
            emitter: self.emitter.stats(),
            bus: BusStats {
                published: self.bus.events_published(),
                rejected: self.bus.events_rejected(),
                subscribers: self.bus.subscriber_count(),
            },
        }
    }

    /// Logs totals, then one line per route.
    pub fn log(&self, label: &str) {
        let stats = self.snapshot();
        info!(
            node = %stats.node,
            received = stats.totals.received,
            forwarded = stats.totals.forwarded,
            dropped = stats.totals.dropped,
            errors = stats.totals.errors,
            circles = stats.totals.circles_completed,
            bus_avg_ms = stats.totals.bus_process_latency.avg_ms,
            pending = stats.correlator.pending,
            "{label}"
        );
        for route in &stats.routes {
            info!(
                adapter = %route.adapter_id,
                next_hop = route.next_hop.as_deref().unwrap_or("-"),
                received = route.counters.received,
                forwarded = route.counters.forwarded,
                dropped = route.counters.dropped,
                errors = route.counters.errors,
                circles = route.counters.circles_completed,
                forward_avg_ms = route.counters.forward_latency.avg_ms,
                forward_min_ms = route.counters.forward_latency.min_ms,
                forward_max_ms = route.counters.forward_latency.max_ms,
                bus_avg_ms = route.counters.bus_process_latency.avg_ms,
                bus_min_ms = route.counters.bus_process_latency.min_ms,
                bus_max_ms = route.counters.bus_process_latency.max_ms,
                "Route stats"
            );
        }
    }
}

/// Logs stats every `interval` until `stop` resolves.
pub async fn run_stats_ticker(
    collector: Arc<StatsCollector>,
    interval: Duration,
    stop: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it.
    ticker.tick().await;
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = ticker.tick() => collector.log("Node stats"),
            () = &mut stop => break,
        }
    }
}
