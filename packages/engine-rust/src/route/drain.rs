//! Stop signalling and in-flight exchange tracking for a route.
//!
//! An atomic counter with RAII guards tracks exchanges inside the route; a
//! `watch` channel tells error handlers that the route is stopping so they
//! stop scheduling redeliveries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Coordinates a route's stop: flags stopping, then waits for in-flight
/// exchanges to leave.
#[derive(Debug)]
pub struct DrainController {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl DrainController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stop_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a signal that fires when the route starts stopping.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_signal.subscribe(),
        }
    }

    /// Flags the route as stopping and notifies every [`StopSignal`].
    pub fn signal_stop(&self) {
        self.stop_signal.send_replace(true);
    }

    /// Clears the stopping flag before the route starts again.
    pub fn reset(&self) {
        self.stop_signal.send_replace(false);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stop_signal.borrow()
    }

    /// Creates a guard counting one in-flight exchange until dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight exchanges to complete, up to `timeout`.
    ///
    /// Returns `false` if exchanges were still in flight at the deadline.
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
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Receiving side of a route's stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the route is stopping. Never resolves if the owning
    /// route is gone.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopping| *stopping).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
