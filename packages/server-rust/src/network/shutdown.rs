//! Node lifecycle: health state, in-flight request tracking, and the
//! two-phase stop signal used by the ordered shutdown.
//!
//! Phase one (`trigger_shutdown`) flips readiness to `Draining` and wakes the
//! stats ticker; the worker pool and forwards drain next. Phase two
//! (`stop_listeners`) tells the HTTP listeners to stop accepting, after the
//! pipeline behind them has emptied.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Node health, reported by the admin probes.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listeners bound, pipeline not yet serving.
    Starting,
    /// Serving requests.
    Ready,
    /// Shutdown in progress; readiness fails.
    Draining,
    /// Everything has stopped.
    Stopped,
}

impl HealthState {
    /// Lowercase name used in health responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates the node's shutdown sequence.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown: watch::Sender<bool>,
    listeners: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (listeners, _) = watch::channel(false);
        Self {
            shutdown,
            listeners,
            in_flight: Arc::new(AtomicU64::new(0)),
            health: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Moves to `Ready` once the pipeline behind the listeners is running.
    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Current health state.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// Phase one: moves to `Draining` and wakes everything waiting in
    /// [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub fn trigger_shutdown(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        self.shutdown.send_replace(true);
    }

    /// Whether phase one has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`trigger_shutdown`](Self::trigger_shutdown) has been called.
    ///
    /// The returned future owns its receiver, so it can be moved into a task.
    pub fn wait_for_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_until_set(self.shutdown.subscribe())
    }

    /// Phase two: tells the HTTP listeners to stop accepting connections.
    pub fn stop_listeners(&self) {
        self.listeners.send_replace(true);
    }

    /// Resolves once [`stop_listeners`](Self::stop_listeners) has been called.
    /// Suitable as an axum graceful-shutdown signal.
    pub fn listeners_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_until_set(self.listeners.subscribe())
    }

    /// Tracks one inbound request until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of ingress requests currently holding a guard.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for every in-flight request to finish.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Final transition once every component has stopped.
    pub fn mark_stopped(&self) {
        self.health.store(Arc::new(HealthState::Stopped));
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    // An error means the controller is gone; treat that as the signal.
    let _ = rx.wait_for(|set| *set).await;
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);

        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        assert!(!controller.is_shutting_down());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());

        controller.mark_stopped();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[test]
    fn health_state_names() {
        assert_eq!(HealthState::Starting.as_str(), "starting");
        assert_eq!(HealthState::Ready.as_str(), "ready");
        assert_eq!(HealthState::Draining.as_str(), "draining");
        assert_eq!(HealthState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn in_flight_guard_counts() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_resolves_after_trigger() {
        let controller = Arc::new(ShutdownController::new());
        let waiter = tokio::spawn(controller.wait_for_shutdown());

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controller.trigger_shutdown();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn signal_created_after_trigger_resolves_immediately() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn listener_stop_is_independent_of_shutdown() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();

        let stopped = controller.listeners_stopped();
        tokio::pin!(stopped);
        let early = tokio::time::timeout(Duration::from_millis(20), &mut stopped).await;
        assert!(early.is_err());

        controller.stop_listeners();
        stopped.await;
    }

    #[tokio::test]
    async fn wait_for_drain_waits_for_guards() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_times_out() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
    }
}
