//! Correlation registry: pending HTTP responses keyed by request ID.
//!
//! Every inbound request registers a [`PendingResponse`] before its event is
//! published. Exactly one completion is ever written to the caller:
//!
//! - Completion is gated by an atomic compare-and-swap on the handle, so a
//!   resolver racing a timeout cannot both write.
//! - Removal from the registry happens before completion on every path
//!   (`resolve`, `expire`, `unregister`), so an entry is removed exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use relaymesh_core::CorrelationId;
use serde::Serialize;
use tokio::sync::oneshot;

use super::reply::HttpReply;

/// Receiving half of a pending response, awaited by the listener.
pub type ReplyReceiver = oneshot::Receiver<HttpReply>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("correlation id {0} is already pending")]
    Duplicate(CorrelationId),
}

/// Why a single completion attempt did not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("response already completed")]
    AlreadyCompleted,
    #[error("caller went away before the response was written")]
    Disconnected,
}

/// Non-fatal outcomes of [`RequestCorrelator::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no pending request for {0}")]
    NotFound(CorrelationId),
    #[error("request {0} was already completed")]
    AlreadyCompleted(CorrelationId),
    #[error("caller for {0} disconnected")]
    Disconnected(CorrelationId),
}

// ---------------------------------------------------------------------------
// PendingResponse
// ---------------------------------------------------------------------------

/// Handle to one waiting caller. Can be completed at most once.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    completed: AtomicBool,
    sink: Mutex<Option<oneshot::Sender<HttpReply>>>,
    registered_at: Instant,
}

impl PendingResponse {
    fn new(id: CorrelationId) -> (Arc<Self>, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(Self {
            id,
            completed: AtomicBool::new(false),
            sink: Mutex::new(Some(tx)),
            registered_at: Instant::now(),
        });
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Writes `reply` to the caller if nobody has completed this handle yet.
    ///
    /// # Errors
    ///
    /// - [`CompletionError::AlreadyCompleted`] if another completion won.
    /// - [`CompletionError::Disconnected`] if this call won but the caller's
    ///   receiver was already dropped. The handle still counts as completed.
    pub fn complete(&self, reply: HttpReply) -> Result<(), CompletionError> {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CompletionError::AlreadyCompleted);
        }

        // Only the CAS winner gets here, so the sender is still in place.
        let Some(tx) = self.sink.lock().take() else {
            return Err(CompletionError::AlreadyCompleted);
        };
        tx.send(reply).map_err(|_| CompletionError::Disconnected)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CorrelatorCounters {
    registered: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
    unregistered: AtomicU64,
    unmatched: AtomicU64,
}

/// Point-in-time view of the correlator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub pending: usize,
    pub registered: u64,
    pub resolved: u64,
    pub expired: u64,
    pub unregistered: u64,
    /// Resolutions that found no pending entry (late or stray responses).
    pub unmatched: u64,
}

// ---------------------------------------------------------------------------
// RequestCorrelator
// ---------------------------------------------------------------------------

/// Concurrent map from correlation ID to the waiting caller.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: DashMap<CorrelationId, Arc<PendingResponse>>,
    counters: CorrelatorCounters,
}

impl RequestCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiting caller under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelatorError::Duplicate`] if `id` is already pending;
    /// the existing entry is left untouched.
    pub fn register(
        &self,
        id: CorrelationId,
    ) -> Result<(Arc<PendingResponse>, ReplyReceiver), CorrelatorError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(CorrelatorError::Duplicate(id)),
            Entry::Vacant(slot) => {
                let (handle, rx) = PendingResponse::new(id);
                slot.insert(Arc::clone(&handle));
                self.counters.registered.fetch_add(1, Ordering::Relaxed);
                Ok((handle, rx))
            }
        }
    }

    /// Removes the entry for `id` and writes `reply` to its caller.
    ///
    /// # Errors
    ///
    /// All [`ResolveError`] variants are non-fatal: the response is dropped.
    pub fn resolve(&self, id: CorrelationId, reply: HttpReply) -> Result<(), ResolveError> {
        let Some((_, handle)) = self.pending.remove(&id) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            return Err(ResolveError::NotFound(id));
        };

        match handle.complete(reply) {
            Ok(()) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(CompletionError::AlreadyCompleted) => Err(ResolveError::AlreadyCompleted(id)),
            Err(CompletionError::Disconnected) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                Err(ResolveError::Disconnected(id))
            }
        }
    }

    /// Removes the entry for `id` without completing it. Used when the
    /// caller's wait has timed out; the caller then completes the returned
    /// handle itself.
    pub fn expire(&self, id: CorrelationId) -> Option<Arc<PendingResponse>> {
        let removed = self.pending.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes the entry for `id` when the request never made it onto the
    /// bus. Returns whether an entry was removed.
    pub fn unregister(&self, id: CorrelationId) -> bool {
        let removed = self.pending.remove(&id).is_some();
        if removed {
            self.counters.unregistered.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            pending: self.pending.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            unregistered: self.counters.unregistered.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn register_then_resolve_delivers() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (_handle, mut rx) = correlator.register(id).unwrap();
        assert!(correlator.is_pending(id));

        correlator.resolve(id, HttpReply::text(200, "hi")).unwrap();

        assert!(!correlator.is_pending(id));
        assert_eq!(rx.try_recv().unwrap().body_text(), "hi");
        assert_eq!(correlator.stats().resolved, 1);
    }

    #[test]
    fn duplicate_register_fails_and_keeps_original() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (_handle, mut rx) = correlator.register(id).unwrap();

        assert_eq!(
            correlator.register(id).unwrap_err(),
            CorrelatorError::Duplicate(id)
        );
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve(id, HttpReply::text(200, "first")).unwrap();
        assert_eq!(rx.try_recv().unwrap().body_text(), "first");
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        assert_eq!(
            correlator.resolve(id, HttpReply::fallback()),
            Err(ResolveError::NotFound(id))
        );
        assert_eq!(correlator.stats().unmatched, 1);
    }

    #[test]
    fn second_resolve_after_first_is_not_found() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (_handle, _rx) = correlator.register(id).unwrap();

        correlator.resolve(id, HttpReply::text(200, "a")).unwrap();
        assert_eq!(
            correlator.resolve(id, HttpReply::text(200, "b")),
            Err(ResolveError::NotFound(id))
        );
    }

    #[test]
    fn expire_then_late_resolve_is_dropped() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (_handle, mut rx) = correlator.register(id).unwrap();

        let expired = correlator.expire(id).unwrap();
        expired.complete(HttpReply::fallback()).unwrap();

        assert_eq!(
            correlator.resolve(id, HttpReply::text(200, "late")),
            Err(ResolveError::NotFound(id))
        );
        assert_eq!(rx.try_recv().unwrap(), HttpReply::fallback());
        assert_eq!(correlator.stats().expired, 1);
    }

    #[test]
    fn completion_is_exactly_once() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (handle, mut rx) = correlator.register(id).unwrap();

        handle.complete(HttpReply::text(200, "one")).unwrap();
        assert_eq!(
            handle.complete(HttpReply::text(200, "two")),
            Err(CompletionError::AlreadyCompleted)
        );
        assert!(handle.is_completed());
        assert_eq!(rx.try_recv().unwrap().body_text(), "one");
    }

    #[test]
    fn complete_after_receiver_dropped_reports_disconnect() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (_handle, rx) = correlator.register(id).unwrap();
        drop(rx);

        assert_eq!(
            correlator.resolve(id, HttpReply::fallback()),
            Err(ResolveError::Disconnected(id))
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn unregister_removes_without_completing() {
        let correlator = RequestCorrelator::new();
        let id = CorrelationId::new();
        let (handle, _rx) = correlator.register(id).unwrap();

        assert!(correlator.unregister(id));
        assert!(!correlator.unregister(id));
        assert!(!handle.is_completed());
        assert_eq!(correlator.stats().unregistered, 1);
    }

    #[test]
    fn racing_resolvers_and_timeout_write_once() {
        let correlator = Arc::new(RequestCorrelator::new());
        let id = CorrelationId::new();
        let (handle, mut rx) = correlator.register(id).unwrap();
        let barrier = Arc::new(Barrier::new(9));

        let mut threads = Vec::new();
        for n in 0..8 {
            let correlator = Arc::clone(&correlator);
            let barrier = Arc::clone(&barrier);
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                correlator
                    .resolve(id, HttpReply::text(200, format!("resolver {n}")))
                    .is_ok()
            }));
        }

        barrier.wait();
        let expired = correlator.expire(id);
        let timeout_won = expired
            .map(|h| h.complete(HttpReply::fallback()).is_ok())
            .unwrap_or(false)
            || handle.complete(HttpReply::fallback()).is_ok();

        let resolver_wins = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(resolver_wins + usize::from(timeout_won), 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(correlator.pending_count(), 0);
    }

    proptest! {
        #[test]
        fn every_registered_id_is_removed_by_its_terminal_op(ops in prop::collection::vec(0u8..3, 1..64)) {
            let correlator = RequestCorrelator::new();
            let mut receivers = Vec::new();

            let ids: Vec<_> = ops.iter().map(|_| CorrelationId::new()).collect();
            for id in &ids {
                let (_handle, rx) = correlator.register(*id).unwrap();
                receivers.push(rx);
            }
            prop_assert_eq!(correlator.pending_count(), ids.len());

            for (id, op) in ids.iter().zip(&ops) {
                match op {
                    0 => prop_assert!(correlator.resolve(*id, HttpReply::fallback()).is_ok()),
                    1 => prop_assert!(correlator.expire(*id).is_some()),
                    _ => prop_assert!(correlator.unregister(*id)),
                }
                prop_assert!(!correlator.is_pending(*id));
            }

            prop_assert_eq!(correlator.pending_count(), 0);
            let stats = correlator.stats();
            prop_assert_eq!(stats.resolved + stats.expired + stats.unregistered, ids.len() as u64);
        }
    }
}
