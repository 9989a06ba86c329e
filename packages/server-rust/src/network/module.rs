//! HTTP listener with deferred startup.
//!
//! `new()` assembles the router, `start()` (or `attach()` with a pre-bound
//! socket) binds, and `serve()` accepts connections until the shutdown
//! future resolves. Binding before serving lets a node learn its actual
//! ports before anything is accepted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, ingress_handler, liveness_handler, readiness_handler, stats_handler,
    AdminState, IngressState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::bridge::ListenerAdapter;
use crate::config::bind_address;

/// One HTTP listener: an address, a router, and (once started) a socket.
pub struct ListenerModule {
    name: String,
    listen_addr: String,
    router: Router,
    listener: Option<TcpListener>,
}

impl ListenerModule {
    /// Creates a listener without binding.
    #[must_use]
    pub fn new(name: &str, listen_addr: &str, router: Router) -> Self {
        Self {
            name: name.to_string(),
            listen_addr: listen_addr.to_string(),
            router,
            listener: None,
        }
    }

    /// An ingress listener routing every request to `adapter`.
    #[must_use]
    pub fn ingress(
        adapter: Arc<ListenerAdapter>,
        shutdown: Arc<ShutdownController>,
        config: &NetworkConfig,
    ) -> Self {
        let name = adapter.id().to_string();
        let listen_addr = adapter.listen_addr().to_string();
        let state = IngressState { adapter, shutdown };
        Self::new(&name, &listen_addr, build_ingress_router(state, config))
    }

    /// The admin listener.
    #[must_use]
    pub fn admin(listen_addr: &str, state: AdminState, config: &NetworkConfig) -> Self {
        Self::new("admin", listen_addr, build_admin_router(state, config))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Binds the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_address(&self.listen_addr)).await?;
        self.attach(listener)
    }

    /// Uses an already-bound socket instead of binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket's local address cannot be read.
    pub fn attach(&mut self, listener: TcpListener) -> anyhow::Result<SocketAddr> {
        let addr = listener.local_addr()?;
        info!(listener = %self.name, %addr, "TCP listener bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serves connections until `shutdown` resolves, then waits for open
    /// connections to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()`/`attach()` was not called, or if the
    /// server hits a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("listener {} served before start()", self.name);
        };
        info!(listener = %self.name, "Serving HTTP connections");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!(listener = %self.name, "Listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ListenerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerModule")
            .field("name", &self.name)
            .field("listen_addr", &self.listen_addr)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Every method and path goes to the ingress handler.
pub fn build_ingress_router(state: IngressState, config: &NetworkConfig) -> Router {
    Router::new()
        .fallback(ingress_handler)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(build_http_layers(config))
        .with_state(state)
}

/// Routes:
/// - `GET /health` -- detailed health JSON
/// - `GET /health/live` -- liveness probe
/// - `GET /health/ready` -- readiness probe
/// - `GET /stats` -- node counters
pub fn build_admin_router(state: AdminState, config: &NetworkConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/stats", get(stats_handler))
        .layer(build_http_layers(config))
        .with_state(state)
}
