//! Worker pool draining one shared request subscription.
//!
//! Every worker pulls from the same [`Subscription`], so each event is
//! handled by exactly one worker. Closing the subscription stops admission;
//! workers finish what is already queued and then exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relaymesh_core::{Event, Subscription};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-event work run by the pool's workers.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Handles one event. Failures are the handler's to log; the worker
    /// always moves on to the next event.
    async fn handle(&self, event: Event);
}

/// A fixed set of workers sharing one subscription.
#[derive(Debug)]
pub struct ForwardWorkerPool {
    subscription: Arc<Subscription>,
    workers: Vec<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
}

impl ForwardWorkerPool {
    /// Spawns `worker_count` workers (at least one) on `subscription`.
    #[must_use]
    pub fn start(
        subscription: Subscription,
        handler: Arc<dyn EventHandler>,
        worker_count: usize,
    ) -> Self {
        let subscription = Arc::new(subscription);
        let processed = Arc::new(AtomicU64::new(0));
        let worker_count = worker_count.max(1);

        let workers = (0..worker_count)
            .map(|worker| {
                let subscription = Arc::clone(&subscription);
                let handler = Arc::clone(&handler);
                let processed = Arc::clone(&processed);
                tokio::spawn(async move {
                    debug!(worker, handler = handler.name(), "Worker started");
                    while let Some(event) = subscription.recv().await {
                        handler.handle(event).await;
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        info!(workers = worker_count, handler = handler.name(), "Worker pool started");
        Self {
            subscription,
            workers,
            processed,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Events handled so far across all workers.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Closes the subscription and waits for every worker to drain and exit.
    pub async fn shutdown(&mut self) {
        self.subscription.close();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "Worker task ended abnormally");
            }
        }
        info!(processed = self.processed(), "Worker pool stopped");
    }
}
