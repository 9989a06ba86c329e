//! Relay router: consumes request events, applies the loop guard, forwards
//! to the route's next hop in the background, and answers locally.
//!
//! The local answer never waits for the forward. Forwards are fire-and-forget
//! tasks on a [`TaskTracker`], drained at shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relaymesh_core::{
    event_types, headers, metadata_keys, Codec, CodecError, CorrelationId, Event,
    EventPublisher, PublishError, RequestPayload, ResponsePayload,
};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::forwarder::{ForwardError, ForwardRequest, Forwarder};
use super::guard::{HopDecision, LoopGuard};
use super::pool::EventHandler;
use super::route::{Route, RouteTable};

/// Outcome of one background forward, sent to the optional observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReport {
    pub request_id: CorrelationId,
    pub adapter_id: String,
    pub target: String,
    pub hop: u32,
    pub elapsed: Duration,
    pub result: Result<(), ForwardError>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("undecodable request event: {0}")]
    Decode(#[from] CodecError),
    #[error("could not publish local response: {0}")]
    Publish(#[from] PublishError),
}

/// What the router did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded { hop: u32 },
    Dropped { hop: u32 },
}

/// Relay-mode request handler.
pub struct RelayRouter {
    node_name: String,
    table: Arc<RouteTable>,
    guard: LoopGuard,
    publisher: Arc<dyn EventPublisher>,
    forwarder: Arc<dyn Forwarder>,
    codec: Codec,
    tracker: TaskTracker,
    observer: Option<mpsc::UnboundedSender<ForwardReport>>,
}

impl RelayRouter {
    #[must_use]
    pub fn new(
        node_name: &str,
        table: Arc<RouteTable>,
        guard: LoopGuard,
        publisher: Arc<dyn EventPublisher>,
        forwarder: Arc<dyn Forwarder>,
        codec: Codec,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            table,
            guard,
            publisher,
            forwarder,
            codec,
            tracker: TaskTracker::new(),
            observer: None,
        }
    }

    /// Reports every finished forward on `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ForwardReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Forwards that have been spawned and not yet finished.
    #[must_use]
    pub fn in_flight_forwards(&self) -> usize {
        self.tracker.len()
    }

    /// Routes one request event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Decode`] if the event is not a request payload,
    /// or [`RelayError::Publish`] if the local answer could not be published
    /// (the caller then receives the listener's fallback).
    pub async fn route(&self, event: &Event) -> Result<RouteOutcome, RelayError> {
        let started = Instant::now();
        let adapter_id = event.metadata(metadata_keys::ADAPTER_ID);
        let route = Arc::clone(self.table.resolve(adapter_id));
        if adapter_id != Some(route.adapter_id()) {
            debug!(
                adapter = adapter_id.unwrap_or("<none>"),
                fallback = route.adapter_id(),
                "Unknown adapter, using first route"
            );
        }
        route.record_received();

        let payload: RequestPayload = event.decode_payload(&self.codec).inspect_err(|_| {
            route.record_error();
        })?;

        if payload
            .visited_nodes()
            .is_some_and(|trail| trail.split(',').any(|n| n.trim() == self.node_name))
        {
            route.record_circle();
            info!(
                correlation_id = %payload.request_id,
                adapter = route.adapter_id(),
                circles = route.snapshot().circles_completed,
                "Circle completed"
            );
        }

        match self.guard.check(payload.hop_count) {
            HopDecision::Drop { hop } => {
                route.record_dropped();
                warn!(
                    correlation_id = %payload.request_id,
                    hop,
                    max_hops = self.guard.max_hops(),
                    "Max hops exceeded, not forwarding"
                );
                let response = ResponsePayload::text(
                    payload.request_id,
                    200,
                    format!("Max hops exceeded at {}", self.node_name),
                );
                self.answer(&route, payload.request_id, response, hop, started)
                    .await?;
                Ok(RouteOutcome::Dropped { hop })
            }
            HopDecision::Forward { hop } => {
                self.spawn_forward(Arc::clone(&route), &payload, hop);
                let response = ResponsePayload::text(
                    payload.request_id,
                    200,
                    format!("Relayed by {} (hop {hop})", self.node_name),
                );
                self.answer(&route, payload.request_id, response, hop, started)
                    .await?;
                Ok(RouteOutcome::Forwarded { hop })
            }
        }
    }

    async fn answer(
        &self,
        route: &Route,
        request_id: CorrelationId,
        response: ResponsePayload,
        hop: u32,
        started: Instant,
    ) -> Result<(), RelayError> {
        let mut response = response
            .with_header(headers::RELAY_NODE, self.node_name.clone())
            .with_header(headers::HOP_COUNT, hop.to_string());
        response.duration_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let event = Event::new(event_types::HTTP_RESPONSE, &self.node_name, &response, &self.codec)?
            .with_metadata(metadata_keys::REQUEST_ID, request_id.to_string());
        self.publisher.publish(event).await?;
        route.record_processed(started.elapsed());
        Ok(())
    }

    fn spawn_forward(&self, route: Arc<Route>, payload: &RequestPayload, hop: u32) {
        let Some(next_hop) = route.next_hop() else {
            route.record_error();
            warn!(adapter = route.adapter_id(), "Route has no next hop, not forwarding");
            return;
        };
        let request = ForwardRequest::build(next_hop, payload, hop, &self.node_name);
        let forwarder = Arc::clone(&self.forwarder);
        let observer = self.observer.clone();

        self.tracker.spawn(async move {
            let request_id = request.request_id;
            let target = request.url.clone();
            let started = Instant::now();
            let result = forwarder.forward(request).await;
            let elapsed = started.elapsed();

            match &result {
                Ok(()) => {
                    route.record_forwarded(elapsed);
                    debug!(correlation_id = %request_id, %target, hop, ?elapsed, "Forwarded");
                }
                Err(err) => {
                    route.record_error();
                    warn!(correlation_id = %request_id, hop, error = %err, "Forward failed");
                }
            }

            if let Some(observer) = observer {
                let _ = observer.send(ForwardReport {
                    request_id,
                    adapter_id: route.adapter_id().to_string(),
                    target,
                    hop,
                    elapsed,
                    result,
                });
            }
        });
    }

    /// Stops accepting new forwards and waits up to `timeout` for in-flight
    /// ones. Returns `false` if some were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}

impl std::fmt::Debug for RelayRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRouter")
            .field("node_name", &self.node_name)
            .field("routes", &self.table.len())
            .field("max_hops", &self.guard.max_hops())
            .field("in_flight_forwards", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler for RelayRouter {
    fn name(&self) -> &'static str {
        "relay-router"
    }

    async fn handle(&self, event: Event) {
        if let Err(err) = self.route(&event).await {
            warn!(event_id = %event.id, error = %err, "Relay failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;
    use relaymesh_core::{EventFilter, EventSubscriber, InMemoryEventBus, Subscription};

    use super::*;
    use crate::bridge::ListenerAdapter;
    use crate::config::RouteConfig;

    #[derive(Default)]
    struct RecordingForwarder {
        sent: Mutex<Vec<ForwardRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&self, request: ForwardRequest) -> Result<(), ForwardError> {
            let url = request.url.clone();
            self.sent.lock().push(request);
            if self.fail {
                Err(ForwardError::Status { url, status: 502 })
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        router: RelayRouter,
        forwarder: Arc<RecordingForwarder>,
        responses: Subscription,
        reports: mpsc::UnboundedReceiver<ForwardReport>,
        table: Arc<RouteTable>,
    }

    fn harness(max_hops: u32, fail: bool) -> Harness {
        let bus = Arc::new(InMemoryEventBus::new("test"));
        let responses = bus
            .subscribe(EventFilter::types(&[event_types::HTTP_RESPONSE]))
            .unwrap();
        let table = Arc::new(
            RouteTable::from_configs(&[
                RouteConfig {
                    listen_addr: ":8080".to_string(),
                    next_hop: Some("http://node-b:8080".to_string()),
                },
                RouteConfig {
                    listen_addr: ":8081".to_string(),
                    next_hop: Some("http://node-c:8081".to_string()),
                },
            ])
            .unwrap(),
        );
        let forwarder = Arc::new(RecordingForwarder {
            fail,
            ..RecordingForwarder::default()
        });
        let (tx, reports) = mpsc::unbounded_channel();
        let router = RelayRouter::new(
            "NodeA",
            Arc::clone(&table),
            LoopGuard::new(max_hops),
            bus as Arc<dyn EventPublisher>,
            Arc::clone(&forwarder) as Arc<dyn Forwarder>,
            Codec::Json,
        )
        .with_observer(tx);
        Harness {
            router,
            forwarder,
            responses,
            reports,
            table,
        }
    }

    fn request_event(listen_addr: &str, hop_count: u32) -> (Event, CorrelationId) {
        request_event_with_trail(listen_addr, hop_count, None)
    }

    fn request_event_with_trail(
        listen_addr: &str,
        hop_count: u32,
        trail: Option<&str>,
    ) -> (Event, CorrelationId) {
        let id = CorrelationId::new();
        let mut headers = BTreeMap::new();
        if let Some(trail) = trail {
            headers.insert("x-visited-nodes".to_string(), trail.to_string());
        }
        let payload = RequestPayload {
            request_id: id,
            method: "POST".to_string(),
            path: "/api/test".to_string(),
            query: BTreeMap::new(),
            headers,
            body: b"hi".to_vec(),
            remote_addr: "127.0.0.1:1".to_string(),
            local_addr: listen_addr.to_string(),
            timestamp_ms: 0,
            tls: false,
            hop_count,
        };
        let adapter_id = ListenerAdapter::adapter_id(listen_addr);
        let event = Event::new(event_types::HTTP_REQUEST, &adapter_id, &payload, &Codec::Json)
            .unwrap()
            .with_metadata(metadata_keys::ADAPTER_ID, adapter_id);
        (event, id)
    }

    async fn next_response(sub: &Subscription) -> ResponsePayload {
        sub.recv().await.unwrap().decode_payload(&Codec::Json).unwrap()
    }

    #[tokio::test]
    async fn forwards_and_acknowledges() {
        let mut h = harness(10, false);
        let (event, id) = request_event(":8081", 2);

        let outcome = h.router.route(&event).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded { hop: 3 });

        let response = next_response(&h.responses).await;
        assert_eq!(response.request_id, Some(id));
        assert_eq!(response.body, b"Relayed by NodeA (hop 3)");
        assert_eq!(response.headers["X-Relay-Node"], "NodeA");
        assert_eq!(response.headers["X-Hop-Count"], "3");

        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.target, "http://node-c:8081/api/test");
        assert_eq!(report.hop, 3);
        assert!(report.result.is_ok());

        let sent = h.forwarder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("X-Hop-Count"), Some("3"));

        let snap = h.table.get("http-server-:8081").unwrap().snapshot();
        assert_eq!((snap.received, snap.forwarded, snap.errors), (1, 1, 0));
        assert_eq!(snap.bus_process_latency.samples, 1);
        assert_eq!(snap.circles_completed, 0);
    }

    #[tokio::test]
    async fn trail_containing_this_node_completes_a_circle() {
        let h = harness(10, false);
        let (back_home, _) = request_event_with_trail(":8080", 3, Some("NodeA,NodeB,NodeC"));
        let (passing, _) = request_event_with_trail(":8080", 1, Some("NodeAA,NodeB"));

        h.router.route(&back_home).await.unwrap();
        h.router.route(&passing).await.unwrap();

        let snap = h.table.get("http-server-:8080").unwrap().snapshot();
        assert_eq!(snap.circles_completed, 1);
        assert_eq!(snap.received, 2);
        assert_eq!(snap.bus_process_latency.samples, 2);
        assert!(snap.bus_process_latency.max_ms >= snap.bus_process_latency.min_ms);
    }

    #[tokio::test]
    async fn failed_answer_records_no_bus_latency() {
        let h = harness(10, false);
        drop(h.responses);
        let (event, _) = request_event(":8080", 0);

        assert!(matches!(h.router.route(&event).await, Err(RelayError::Publish(_))));
        let snap = h.table.totals();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.bus_process_latency.samples, 0);
    }

    #[tokio::test]
    async fn drops_past_ceiling_without_forwarding() {
        let mut h = harness(10, false);
        let (event, id) = request_event(":8080", 10);

        let outcome = h.router.route(&event).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Dropped { hop: 11 });

        let response = next_response(&h.responses).await;
        assert_eq!(response.request_id, Some(id));
        assert_eq!(response.body, b"Max hops exceeded at NodeA");

        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert!(h.forwarder.sent.lock().is_empty());
        assert!(h.reports.try_recv().is_err());
        assert_eq!(h.table.totals().dropped, 1);
    }

    #[tokio::test]
    async fn forward_failure_still_acknowledges() {
        let mut h = harness(10, true);
        let (event, _) = request_event(":8080", 0);

        h.router.route(&event).await.unwrap();
        let response = next_response(&h.responses).await;
        assert_eq!(response.body, b"Relayed by NodeA (hop 1)");

        let report = h.reports.recv().await.unwrap();
        assert!(matches!(report.result, Err(ForwardError::Status { status: 502, .. })));
        assert_eq!(h.table.totals().errors, 1);
    }

    #[tokio::test]
    async fn unknown_adapter_uses_first_route() {
        let mut h = harness(10, false);
        let (event, _) = request_event(":9999", 0);

        h.router.route(&event).await.unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.adapter_id, "http-server-:8080");
        assert_eq!(report.target, "http://node-b:8080/api/test");
    }

    #[tokio::test]
    async fn undecodable_event_counts_an_error() {
        let h = harness(10, false);
        let event = Event::new(event_types::HTTP_REQUEST, "x", &"not a request", &Codec::Json)
            .unwrap();

        assert!(matches!(h.router.route(&event).await, Err(RelayError::Decode(_))));
        assert_eq!(h.table.totals().errors, 1);
        assert_eq!(h.table.totals().received, 1);
    }

    #[tokio::test]
    async fn drain_waits_for_forwards() {
        let mut h = harness(10, false);
        for _ in 0..5 {
            let (event, _) = request_event(":8080", 0);
            h.router.route(&event).await.unwrap();
        }
        assert!(h.router.drain(Duration::from_secs(1)).await);
        assert_eq!(h.router.in_flight_forwards(), 0);
        for _ in 0..5 {
            assert!(h.reports.recv().await.is_some());
        }
    }
}
