//! Supervised restarts for routes that failed to start.
//!
//! A [`BackgroundWorker`] receives [`RestartTask`]s and, on every tick,
//! retries the routes whose backoff delay has elapsed. Routes that still
//! fail after the configured number of attempts are reported as exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::RouteController;
use crate::config::SupervisorConfig;
use crate::service::{BackgroundRunnable, BackgroundWorker};

/// Request to bring a route back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTask {
    pub route_id: String,
}

#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    attempts: u32,
    due: Instant,
}

#[derive(Default)]
struct SupervisorState {
    pending: HashMap<String, PendingRestart>,
    exhausted: Vec<String>,
}

struct RestartRunnable {
    controller: Arc<RouteController>,
    config: SupervisorConfig,
    state: Arc<Mutex<SupervisorState>>,
}

impl RestartRunnable {
    fn due_routes(&self, now: Instant) -> Vec<(String, u32)> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(id, pending)| (id.clone(), pending.attempts))
            .collect()
    }
}

#[async_trait]
impl BackgroundRunnable for RestartRunnable {
    type Task = RestartTask;

    async fn run(&mut self, task: RestartTask) {
        let due = Instant::now() + self.config.delay_for(1);
        let mut state = self.state.lock();
        state.exhausted.retain(|id| id != &task.route_id);
        state
            .pending
            .entry(task.route_id)
            .or_insert(PendingRestart { attempts: 0, due });
    }

    async fn on_tick(&mut self) {
        for (route_id, previous_attempts) in self.due_routes(Instant::now()) {
            let attempt = previous_attempts + 1;
            match self.controller.start(&route_id).await {
                Ok(()) => {
                    info!(route = %route_id, attempt, "supervised restart succeeded");
                    self.state.lock().pending.remove(&route_id);
                }
                Err(e) if self.config.max_attempts > 0 && attempt >= self.config.max_attempts => {
                    error!(route = %route_id, attempts = attempt, error = %e, "giving up on route");
                    let mut state = self.state.lock();
                    state.pending.remove(&route_id);
                    state.exhausted.push(route_id);
                }
                Err(e) => {
                    let delay = self.config.delay_for(attempt + 1);
                    warn!(
                        route = %route_id,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "supervised restart failed"
                    );
                    if let Some(pending) = self.state.lock().pending.get_mut(&route_id) {
                        pending.attempts = attempt;
                        pending.due = Instant::now() + delay;
                    }
                }
            }
        }
    }
}

/// Retries failed route starts with exponential backoff.
pub struct RouteSupervisor {
    worker: BackgroundWorker<RestartRunnable>,
    state: Arc<Mutex<SupervisorState>>,
}

impl RouteSupervisor {
    /// Starts the supervisor's background worker.
    pub fn start(controller: Arc<RouteController>, config: SupervisorConfig) -> Self {
        let state = Arc::new(Mutex::new(SupervisorState::default()));
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));
        let runnable = RestartRunnable {
            controller,
            config,
            state: Arc::clone(&state),
        };
        Self {
            worker: BackgroundWorker::start(runnable, tick),
            state,
        }
    }

    /// Schedules restarts for `route_id` until it starts or is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor has been stopped.
    pub async fn schedule(&self, route_id: impl Into<String>) -> anyhow::Result<()> {
        self.worker
            .submit(RestartTask {
                route_id: route_id.into(),
            })
            .await
    }

    /// Routes waiting for a restart attempt.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Routes that used up their restart attempts.
    #[must_use]
    pub fn exhausted(&self) -> Vec<String> {
        self.state.lock().exhausted.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }
}
