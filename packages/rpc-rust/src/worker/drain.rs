//! Stop signal and in-flight tracking for the worker pool.
//!
//! The pool state lives in an `ArcSwap`; in-flight deliveries are counted by
//! RAII guards, and the last guard to drop wakes anyone waiting for the pool
//! to go idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Pool lifecycle as seen from outside.
///
/// `Running -> Draining -> Stopped` on shutdown, or `Running -> Stopped` when
/// every worker exits on its own (the delivery stream ended).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Workers are pulling deliveries.
    Running,
    /// No new deliveries are pulled; in-flight ones are finishing.
    Draining,
    /// No worker is running.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates worker shutdown.
///
/// Workers hold a guard from `in_flight_guard()` while a delivery is being
/// handled and watch `stop_receiver()` between deliveries.
#[derive(Debug)]
pub struct DrainTracker {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    state: ArcSwap<PoolState>,
}

impl DrainTracker {
    /// A tracker for a pool whose workers are already pulling.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stop_signal: tx,
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(PoolState::Running),
        }
    }

    /// Receiver that observes `true` once stop is triggered.
    #[must_use]
    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    /// Moves to `Draining` and wakes every stop receiver. No-op once stopped.
    pub fn trigger_stop(&self) {
        if self.state() == PoolState::Running {
            self.state.store(Arc::new(PoolState::Draining));
        }
        self.stop_signal.send_replace(true);
    }

    /// Records that no worker is left.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(PoolState::Stopped));
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        **self.state.load()
    }

    /// Counts one delivery as in flight until the guard is dropped, including
    /// on panic unwind.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits for in-flight deliveries to finish, up to `timeout`.
    ///
    /// Returns `true` once nothing is in flight, `false` if the timeout
    /// expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            // Register before checking, so a guard dropped in between still
            // wakes this waiter.
            idle.as_mut().enable();
            if self.in_flight_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight_count() == 0;
            }
        }
    }
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one delivery counted as in flight.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// Resolves once `rx` observes `true`, or once the sender is gone.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn stop_moves_running_to_draining_only() {
        let tracker = DrainTracker::new();
        assert_eq!(tracker.state(), PoolState::Running);
        tracker.trigger_stop();
        assert_eq!(tracker.state(), PoolState::Draining);
        tracker.mark_stopped();
        tracker.trigger_stop();
        assert_eq!(tracker.state(), PoolState::Stopped);
    }

    #[test]
    fn guards_count_in_flight() {
        let tracker = DrainTracker::new();
        let a = tracker.in_flight_guard();
        let b = tracker.in_flight_guard();
        assert_eq!(tracker.in_flight_count(), 2);
        drop(a);
        assert_eq!(tracker.in_flight_count(), 1);
        drop(b);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn stop_receiver_observes_trigger() {
        let tracker = DrainTracker::new();
        let mut rx = tracker.stop_receiver();
        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tracker.trigger_stop();
        waiter.await.unwrap();

        let mut late = tracker.stop_receiver();
        stopped(&mut late).await;
    }

    #[tokio::test(start_paused = true)]
    async fn drain_wakes_when_last_guard_drops() {
        let tracker = DrainTracker::new();
        let first = tracker.in_flight_guard();
        let second = tracker.in_flight_guard();
        tracker.trigger_stop();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(second);
        });

        let started = Instant::now();
        assert!(tracker.wait_for_drain(Duration::from_secs(2)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60));
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_guard_held() {
        let tracker = DrainTracker::new();
        let _guard = tracker.in_flight_guard();
        tracker.trigger_stop();
        assert!(!tracker.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(tracker.state(), PoolState::Draining);
    }

    #[tokio::test]
    async fn idle_tracker_drains_immediately() {
        let tracker = DrainTracker::new();
        assert!(tracker.wait_for_drain(Duration::ZERO).await);
    }
}
