//! Route table: listener adapter → next hop, with per-route counters.
//!
//! The table is built once at startup and never mutated, so lookups need no
//! locking. Counters are lock-free atomics; every update is mirrored to the
//! `metrics` facade with an `adapter` label.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bridge::ListenerAdapter;
use crate::config::{ConfigError, RouteConfig};

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Lock-free min/max/total accumulator for one kind of latency.
#[derive(Debug, Default)]
struct LatencyRecorder {
    samples: AtomicU64,
    nanos_total: AtomicU64,
    /// 0 until the first sample.
    nanos_min: AtomicU64,
    nanos_max: AtomicU64,
}

impl LatencyRecorder {
    fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX).max(1);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.nanos_total.fetch_add(nanos, Ordering::Relaxed);
        let _ = self
            .nanos_min
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == 0 || nanos < current).then_some(nanos)
            });
        self.nanos_max.fetch_max(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let samples = self.samples.load(Ordering::Relaxed);
        let total = self.nanos_total.load(Ordering::Relaxed);
        LatencySnapshot {
            samples,
            min_ms: nanos_to_ms(self.nanos_min.load(Ordering::Relaxed)),
            max_ms: nanos_to_ms(self.nanos_max.load(Ordering::Relaxed)),
            avg_ms: if samples == 0 {
                0.0
            } else {
                nanos_to_ms(total / samples)
            },
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_ms(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}

/// Latency range in milliseconds. All fields are 0 when `samples` is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

impl LatencySnapshot {
    /// Widens the range; the average is weighted by sample count.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let samples = self.samples + other.samples;
        #[allow(clippy::cast_precision_loss)]
        let avg_ms = if samples == 0 {
            0.0
        } else {
            (self.avg_ms * self.samples as f64 + other.avg_ms * other.samples as f64)
                / samples as f64
        };
        let min_ms = match (self.samples, other.samples) {
            (0, _) => other.min_ms,
            (_, 0) => self.min_ms,
            _ => self.min_ms.min(other.min_ms),
        };
        Self {
            samples,
            min_ms,
            max_ms: self.max_ms.max(other.max_ms),
            avg_ms,
        }
    }
}

/// Lock-free per-route counters.
#[derive(Debug, Default)]
pub struct RouteCounters {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    circles_completed: AtomicU64,
    /// Successful forwards, measured around the outbound call.
    forward: LatencyRecorder,
    /// From receiving the request event to publishing the local answer.
    bus_process: LatencyRecorder,
}

impl RouteCounters {
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            circles_completed: self.circles_completed.load(Ordering::Relaxed),
            forward_latency: self.forward.snapshot(),
            bus_process_latency: self.bus_process.snapshot(),
        }
    }
}

/// Point-in-time copy of a route's (or the node's) counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub errors: u64,
    /// Requests that arrived carrying this node in their visited trail.
    pub circles_completed: u64,
    pub forward_latency: LatencySnapshot,
    pub bus_process_latency: LatencySnapshot,
}

impl CounterSnapshot {
    /// Sums counts and merges both latency ranges.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            received: self.received + other.received,
            forwarded: self.forwarded + other.forwarded,
            dropped: self.dropped + other.dropped,
            errors: self.errors + other.errors,
            circles_completed: self.circles_completed + other.circles_completed,
            forward_latency: self.forward_latency.merge(other.forward_latency),
            bus_process_latency: self.bus_process_latency.merge(other.bus_process_latency),
        }
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One entry of the route table.
#[derive(Debug)]
pub struct Route {
    adapter_id: String,
    listen_addr: String,
    next_hop: Option<String>,
    counters: RouteCounters,
}

impl Route {
    #[must_use]
    pub fn new(listen_addr: &str, next_hop: Option<&str>) -> Self {
        Self {
            adapter_id: ListenerAdapter::adapter_id(listen_addr),
            listen_addr: listen_addr.to_string(),
            next_hop: next_hop.map(ToString::to_string),
            counters: RouteCounters::default(),
        }
    }

    #[must_use]
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    #[must_use]
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    #[must_use]
    pub fn next_hop(&self) -> Option<&str> {
        self.next_hop.as_deref()
    }

    pub fn record_received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_requests_received_total", "adapter" => self.adapter_id.clone())
            .increment(1);
    }

    pub fn record_forwarded(&self, elapsed: Duration) {
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        self.counters.forward.record(elapsed);
        metrics::counter!("relay_requests_forwarded_total", "adapter" => self.adapter_id.clone())
            .increment(1);
    }

    pub fn record_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_requests_dropped_total", "adapter" => self.adapter_id.clone())
            .increment(1);
    }

    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_errors_total", "adapter" => self.adapter_id.clone()).increment(1);
    }

    /// Records the time from receiving a request event to publishing its answer.
    pub fn record_processed(&self, elapsed: Duration) {
        self.counters.bus_process.record(elapsed);
    }

    pub fn record_circle(&self) {
        self.counters.circles_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_circles_completed_total", "adapter" => self.adapter_id.clone())
            .increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Immutable mapping from adapter identity to route.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    by_adapter: HashMap<String, usize>,
}

impl RouteTable {
    /// Builds the table from configured routes, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoRoutes`] if `configs` is empty, or
    /// [`ConfigError::DuplicateListenAddr`] if two routes share a listener.
    pub fn from_configs(configs: &[RouteConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        let mut routes = Vec::with_capacity(configs.len());
        let mut by_adapter = HashMap::with_capacity(configs.len());
        for config in configs {
            let route = Route::new(&config.listen_addr, config.next_hop.as_deref());
            if by_adapter
                .insert(route.adapter_id.clone(), routes.len())
                .is_some()
            {
                return Err(ConfigError::DuplicateListenAddr(config.listen_addr.clone()));
            }
            routes.push(Arc::new(route));
        }
        Ok(Self { routes, by_adapter })
    }

    /// Looks up the route for `adapter_id`. Unknown or missing identities
    /// fall back to the first route.
    #[must_use]
    pub fn resolve(&self, adapter_id: Option<&str>) -> &Arc<Route> {
        let index = adapter_id
            .and_then(|id| self.by_adapter.get(id).copied())
            .unwrap_or(0);
        &self.routes[index]
    }

    #[must_use]
    pub fn get(&self, adapter_id: &str) -> Option<&Arc<Route>> {
        self.by_adapter.get(adapter_id).map(|&i| &self.routes[i])
    }

    #[must_use]
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Node-wide totals across all routes.
    #[must_use]
    pub fn totals(&self) -> CounterSnapshot {
        self.routes
            .iter()
            .map(|r| r.snapshot())
            .fold(CounterSnapshot::default(), CounterSnapshot::merge)
    }
}
