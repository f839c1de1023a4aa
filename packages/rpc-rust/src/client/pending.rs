//! Table of calls awaiting a reply on the shared reply queue.
//!
//! Callers register concurrently; the reply dispatcher is the only task that
//! resolves entries. Every registration is paired with a [`PendingGuard`]
//! that removes the entry when the call ends, whatever the exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use switchboard_core::CorrelationId;
use tokio::sync::oneshot;

use super::CallError;

/// Slot the dispatcher fills for one waiting call.
pub type ReplySlot = oneshot::Receiver<Result<Bytes, CallError>>;

/// Pending calls keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    waiters: DashMap<CorrelationId, oneshot::Sender<Result<Bytes, CallError>>>,
    closed: AtomicBool,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id`.
    ///
    /// # Errors
    ///
    /// Returns `CallError::ConnectionLost` once the reply stream has ended;
    /// no reply could ever arrive.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
    ) -> Result<(PendingGuard, ReplySlot), CallError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.clone(), tx);
        let guard = PendingGuard {
            calls: Arc::clone(self),
            id,
        };
        // Checked after insert so a concurrent `fail_all` cannot miss us.
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::ConnectionLost);
        }
        Ok((guard, rx))
    }

    /// Hands `body` to the call waiting on `id`. Returns `false` if no call
    /// is waiting (unknown id, or the caller already gave up).
    pub fn resolve(&self, id: &CorrelationId, body: Bytes) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => tx.send(Ok(body)).is_ok(),
            None => false,
        }
    }

    /// Fails every waiting call with `ConnectionLost` and refuses new ones.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<CorrelationId> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(CallError::ConnectionLost));
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Removes its entry from [`PendingCalls`] on drop.
#[derive(Debug)]
pub struct PendingGuard {
    calls: Arc<PendingCalls>,
    id: CorrelationId,
}

impl PendingGuard {
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.waiters.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_reaches_only_matching_waiter() {
        let calls = Arc::new(PendingCalls::new());
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        let (_ga, rx_a) = calls.register(a.clone()).unwrap();
        let (_gb, mut rx_b) = calls.register(b).unwrap();

        assert!(calls.resolve(&a, Bytes::from_static(b"for-a")));
        assert_eq!(rx_a.await.unwrap().unwrap(), Bytes::from_static(b"for-a"));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn unknown_id_is_not_resolved() {
        let calls = PendingCalls::new();
        assert!(!calls.resolve(&CorrelationId::from("stray"), Bytes::new()));
    }

    #[test]
    fn guard_drop_deregisters() {
        let calls = Arc::new(PendingCalls::new());
        let id = CorrelationId::generate();
        let (guard, _rx) = calls.register(id.clone()).unwrap();
        assert_eq!(guard.correlation_id(), &id);
        drop(guard);
        assert!(calls.is_empty());
        assert!(!calls.resolve(&id, Bytes::new()));
    }

    #[tokio::test]
    async fn fail_all_wakes_waiters_and_closes() {
        let calls = Arc::new(PendingCalls::new());
        let (_guard, rx) = calls.register(CorrelationId::generate()).unwrap();
        calls.fail_all();

        assert!(matches!(rx.await.unwrap(), Err(CallError::ConnectionLost)));
        assert!(calls.is_closed());
        assert!(matches!(
            calls.register(CorrelationId::generate()),
            Err(CallError::ConnectionLost)
        ));
        assert!(calls.is_empty());
    }
}
