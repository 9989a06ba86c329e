//! Relay node assembly and lifecycle.
//!
//! A node owns one event bus, one correlator, one route table, one listener
//! per route, a response emitter, and a worker pool running either the relay
//! router or the echo responder.
//!
//! Lifecycle: `new()` validates and allocates, `start()` binds every
//! listener and starts the pipeline, `serve()` accepts traffic until the
//! shutdown future resolves and then stops in order:
//!
//! 1. readiness flips to `Draining`
//! 2. the request subscription closes and the workers drain it
//! 3. in-flight forwards drain
//! 4. listeners stop accepting and in-flight requests finish
//! 5. the response subscription closes and the emitter drains it
//! 6. the bus closes and final stats are logged

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use relaymesh_core::{
    event_types, EventFilter, EventPublisher, EventSubscriber, InMemoryEventBus, Subscription,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{ListenerAdapter, RequestCorrelator, ResponseEmitter};
use crate::config::{NodeConfig, NodeMode};
use crate::network::{AdminState, ListenerModule, ShutdownController};
use crate::relay::{
    EchoResponder, EventHandler, ForwardReport, ForwardWorkerPool, Forwarder, HttpForwarder,
    LoopGuard, RelayRouter, RouteTable,
};
use crate::stats::{run_stats_ticker, StatsCollector};

struct Running {
    listeners: Vec<ListenerModule>,
    admin: Option<ListenerModule>,
    pool: ForwardWorkerPool,
    router: Option<Arc<RelayRouter>>,
    responses: Arc<Subscription>,
    emitter_task: JoinHandle<()>,
}

/// A relay node.
pub struct RelayNode {
    config: NodeConfig,
    bus: Arc<InMemoryEventBus>,
    correlator: Arc<RequestCorrelator>,
    table: Arc<RouteTable>,
    emitter: Arc<ResponseEmitter>,
    stats: Arc<StatsCollector>,
    shutdown: Arc<ShutdownController>,
    forwarder: Arc<dyn Forwarder>,
    observer: Option<mpsc::UnboundedSender<ForwardReport>>,
    handler: Option<Arc<dyn EventHandler>>,
    running: Option<Running>,
}

impl RelayNode {
    /// Validates `config` and allocates the node's shared components.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// for forwarding cannot be built.
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let bus = Arc::new(InMemoryEventBus::with_capacity(
            &config.node_name,
            config.bus_capacity,
            config.publish_timeout,
        ));
        let correlator = Arc::new(RequestCorrelator::new());
        let table = Arc::new(RouteTable::from_configs(&config.routes)?);
        let emitter = Arc::new(ResponseEmitter::new(Arc::clone(&correlator), config.codec));
        let stats = Arc::new(StatsCollector::new(
            &config.node_name,
            config.mode,
            Arc::clone(&table),
            Arc::clone(&correlator),
            Arc::clone(&emitter),
            Arc::clone(&bus),
        ));
        let forwarder = HttpForwarder::new(config.forward_timeout)
            .context("failed to build forwarding HTTP client")?;

        Ok(Self {
            config,
            bus,
            correlator,
            table,
            emitter,
            stats,
            shutdown: Arc::new(ShutdownController::new()),
            forwarder: Arc::new(forwarder),
            observer: None,
            handler: None,
            running: None,
        })
    }

    /// Replaces the forwarder. Must be called before `start()`.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Reports every finished forward on `observer`. Must be called before
    /// `start()`.
    #[must_use]
    pub fn with_forward_observer(mut self, observer: mpsc::UnboundedSender<ForwardReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handles request events with `handler` instead of the mode's
    /// built-in handler. Must be called before `start()`.
    #[must_use]
    pub fn with_request_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn bus(&self) -> Arc<InMemoryEventBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn correlator(&self) -> Arc<RequestCorrelator> {
        Arc::clone(&self.correlator)
    }

    #[must_use]
    pub fn route_table(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Bound addresses of the route listeners, in route order.
    #[must_use]
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .as_ref()
            .map(|r| r.listeners.iter().filter_map(ListenerModule::local_addr).collect())
            .unwrap_or_default()
    }

    /// Bound address of the admin listener, if one is configured.
    #[must_use]
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|r| r.admin.as_ref())
            .and_then(ListenerModule::local_addr)
    }

    /// Binds every configured listen address and starts the pipeline.
    /// Returns the bound addresses in route order.
    ///
    /// # Errors
    ///
    /// Returns an error if any address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<Vec<SocketAddr>> {
        let mut sockets = Vec::with_capacity(self.config.routes.len());
        for route in &self.config.routes {
            let addr = crate::config::bind_address(&route.listen_addr);
            let socket = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            sockets.push(socket);
        }
        self.start_with_listeners(sockets).await
    }

    /// Starts the pipeline on pre-bound sockets, one per route in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket count does not match the route count,
    /// the node was already started, or the admin address cannot be bound.
    pub async fn start_with_listeners(
        &mut self,
        sockets: Vec<TcpListener>,
    ) -> anyhow::Result<Vec<SocketAddr>> {
        if self.running.is_some() {
            anyhow::bail!("node {} already started", self.config.node_name);
        }
        if sockets.len() != self.table.len() {
            anyhow::bail!(
                "{} listeners supplied for {} routes",
                sockets.len(),
                self.table.len()
            );
        }

        let publisher: Arc<dyn EventPublisher> = Arc::clone(&self.bus) as Arc<dyn EventPublisher>;

        // Response path first, so no answer is published before someone listens.
        let responses = Arc::new(
            self.bus
                .subscribe(EventFilter::types(&[event_types::HTTP_RESPONSE]))?,
        );
        let emitter_task = tokio::spawn(Arc::clone(&self.emitter).run(Arc::clone(&responses)));

        let requests = self
            .bus
            .subscribe(EventFilter::types(&[event_types::HTTP_REQUEST]))?;
        let (handler, router): (Arc<dyn EventHandler>, Option<Arc<RelayRouter>>) =
            match (self.handler.clone(), self.config.mode) {
                (Some(custom), _) => (custom, None),
                (None, NodeMode::Relay) => {
                    let mut router = RelayRouter::new(
                        &self.config.node_name,
                        Arc::clone(&self.table),
                        LoopGuard::new(self.config.max_hops),
                        Arc::clone(&publisher),
                        Arc::clone(&self.forwarder),
                        self.config.codec,
                    );
                    if let Some(observer) = self.observer.clone() {
                        router = router.with_observer(observer);
                    }
                    let router = Arc::new(router);
                    (Arc::clone(&router) as Arc<dyn EventHandler>, Some(router))
                }
                (None, NodeMode::Echo) => (
                    Arc::new(EchoResponder::new(
                        &self.config.node_name,
                        Arc::clone(&publisher),
                        self.config.codec,
                    )) as Arc<dyn EventHandler>,
                    None,
                ),
            };
        let pool = ForwardWorkerPool::start(requests, handler, self.config.effective_worker_count());

        let mut listeners = Vec::with_capacity(sockets.len());
        let mut addrs = Vec::with_capacity(sockets.len());
        for (route, socket) in self.table.routes().iter().zip(sockets) {
            let adapter = Arc::new(ListenerAdapter::new(
                route.listen_addr(),
                Arc::clone(&self.correlator),
                Arc::clone(&publisher),
                self.config.codec,
                self.config.response_timeout,
            ));
            let mut listener =
                ListenerModule::ingress(adapter, Arc::clone(&self.shutdown), &self.config.network);
            addrs.push(listener.attach(socket)?);
            listeners.push(listener);
        }

        let admin = match &self.config.admin_addr {
            Some(addr) => {
                let state = AdminState {
                    shutdown: Arc::clone(&self.shutdown),
                    stats: Arc::clone(&self.stats),
                };
                let mut admin = ListenerModule::admin(addr, state, &self.config.network);
                admin.start().await?;
                Some(admin)
            }
            None => None,
        };

        info!(
            node = %self.config.node_name,
            mode = %self.config.mode,
            routes = self.table.len(),
            workers = pool.worker_count(),
            max_hops = self.config.max_hops,
            "Node started"
        );
        for route in self.table.routes() {
            info!(
                adapter = route.adapter_id(),
                next_hop = route.next_hop().unwrap_or("-"),
                "Route"
            );
        }

        self.running = Some(Running {
            listeners,
            admin,
            pool,
            router,
            responses,
            emitter_task,
        });
        Ok(addrs)
    }

    /// Serves traffic until `shutdown` resolves, then stops in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, or if a listener failed.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(mut running) = self.running.take() else {
            anyhow::bail!("node {} served before start()", self.config.node_name);
        };

        let mut listener_tasks = Vec::with_capacity(running.listeners.len() + 1);
        for listener in running.listeners.drain(..).chain(running.admin.take()) {
            let stop = self.shutdown.listeners_stopped();
            listener_tasks.push(tokio::spawn(listener.serve(stop)));
        }

        let ticker = tokio::spawn(run_stats_ticker(
            Arc::clone(&self.stats),
            self.config.stats_interval,
            self.shutdown.wait_for_shutdown(),
        ));

        self.shutdown.set_ready();
        info!(node = %self.config.node_name, "Node ready");

        shutdown.await;
        info!(node = %self.config.node_name, "Shutting down");
        self.shutdown.trigger_shutdown();

        running.pool.shutdown().await;

        if let Some(router) = &running.router {
            if !router.drain(self.config.network.drain_timeout).await {
                warn!(
                    remaining = router.in_flight_forwards(),
                    "Forward drain timed out"
                );
            }
        }

        self.shutdown.stop_listeners();
        let mut first_error = None;
        for task in listener_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "Listener failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    warn!(error = %err, "Listener task ended abnormally");
                }
            }
        }
        if !self
            .shutdown
            .wait_for_drain(self.config.network.drain_timeout)
            .await
        {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "Request drain timed out"
            );
        }

        running.responses.close();
        if let Err(err) = running.emitter_task.await {
            warn!(error = %err, "Emitter task ended abnormally");
        }

        self.bus.close();
        let _ = ticker.await;
        self.stats.log("Final stats");
        self.shutdown.mark_stopped();
        info!(node = %self.config.node_name, "Node stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("node_name", &self.config.node_name)
            .field("mode", &self.config.mode)
            .field("routes", &self.table.len())
            .field("started", &self.running.is_some())
            .finish_non_exhaustive()
    }
}
