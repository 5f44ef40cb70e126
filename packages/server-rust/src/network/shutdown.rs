//! Graceful shutdown with in-flight call tracking.
//!
//! The health state lives in an `ArcSwap` so the dispatcher can check it
//! without locking. Every admitted call holds an [`InFlightGuard`]; the
//! drain waits for the guard count to reach zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Server lifecycle state.
///
/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Built, not yet serving.
    Starting,
    /// Serving calls.
    Ready,
    /// Shutdown requested: new calls are refused, admitted calls finish.
    Draining,
    /// Every admitted call has finished.
    Stopped,
}

impl HealthState {
    /// Whether a new call may start in this state.
    #[must_use]
    pub fn admits_calls(self) -> bool {
        matches!(self, HealthState::Starting | HealthState::Ready)
    }
}

/// Coordinates admission, shutdown signalling and draining.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver flipped to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.shutdown_receiver();
        // The sender is owned by `self`; this cannot observe it closed.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Moves to `Draining` and notifies every receiver. Idempotent.
    pub fn trigger_shutdown(&self) {
        if self.health_state() != HealthState::Stopped {
            self.health_state.store(Arc::new(HealthState::Draining));
        }
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Admits a new call, or returns `None` once draining has begun.
    ///
    /// The counter is raised before the state is checked, so a drain that
    /// starts concurrently either sees this call or the call sees the drain.
    #[must_use]
    pub fn try_admit(&self) -> Option<InFlightGuard> {
        let guard = self.in_flight_guard();
        if self.health_state().admits_calls() {
            Some(guard)
        } else {
            None
        }
    }

    /// Counts a call as in flight until the guard is dropped, regardless of
    /// the current state.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for in-flight calls to finish.
    ///
    /// Returns `true` and moves to `Stopped` when the count reaches zero.
    /// Returns `false` on timeout, leaving the state at `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
