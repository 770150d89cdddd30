//! In-memory saga service.
//!
//! Keeps live sagas in a `DashMap` keyed by saga id. A saga's step list is
//! append-only while it is pending and read-only once completion or
//! compensation starts. Terminal sagas are removed from the registry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError, Value};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SagaCoordinator, SagaError, SagaService, SagaState, SagaStep, SharedCoordinator, StepFailure};
use crate::config::SagaConfig;
use crate::processor::SharedProcessor;
use crate::service::{ManagedService, ServiceContext};

struct Shared {
    sagas: DashMap<String, Arc<InMemorySagaCoordinator>>,
    config: RwLock<SagaConfig>,
    shutdown: Mutex<CancellationToken>,
}

impl Shared {
    fn token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }
}

/// Saga registry held in process memory.
pub struct InMemorySagaService {
    shared: Arc<Shared>,
}

impl InMemorySagaService {
    #[must_use]
    pub fn new(config: SagaConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                sagas: DashMap::new(),
                config: RwLock::new(config),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Number of sagas that have not reached a terminal state.
    #[must_use]
    pub fn active_sagas(&self) -> usize {
        self.shared.sagas.len()
    }
}

impl Default for InMemorySagaService {
    fn default() -> Self {
        Self::new(SagaConfig::default())
    }
}

#[async_trait]
impl SagaService for InMemorySagaService {
    async fn new_saga(&self) -> Result<SharedCoordinator, SagaError> {
        let token = self.shared.token();
        if token.is_cancelled() {
            return Err(SagaError::ServiceStopped);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let service = Arc::downgrade(&self.shared);
        let coordinator = Arc::new_cyclic(|me| InMemorySagaCoordinator {
            id: id.clone(),
            me: me.clone(),
            service,
            steps: RwLock::new(Vec::new()),
            state: Mutex::new(SagaState::Pending),
            timers: token.child_token(),
        });
        self.shared.sagas.insert(id.clone(), Arc::clone(&coordinator));
        debug!(saga_id = %id, "saga created");
        Ok(coordinator)
    }

    async fn get_saga(&self, id: &str) -> Option<SharedCoordinator> {
        self.shared
            .sagas
            .get(id)
            .map(|entry| Arc::clone(entry.value()) as SharedCoordinator)
    }
}

#[async_trait]
impl ManagedService for InMemorySagaService {
    fn name(&self) -> &str {
        "in-memory-saga-service"
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        *self.shared.config.write() = ctx.config.saga.clone();
        let mut token = self.shared.shutdown.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        info!("saga service ready");
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        self.shared.token().cancel();
        let abandoned = self.shared.sagas.len();
        self.shared.sagas.clear();
        if abandoned > 0 {
            warn!(abandoned, "saga service stopped with pending sagas");
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Complete,
    Compensate,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Self::Complete => "completion",
            Self::Compensate => "compensation",
        }
    }

    fn running(self) -> SagaState {
        match self {
            Self::Complete => SagaState::Completing,
            Self::Compensate => SagaState::Compensating,
        }
    }

    fn done(self) -> SagaState {
        match self {
            Self::Complete => SagaState::Completed,
            Self::Compensate => SagaState::Compensated,
        }
    }

    fn action(self, step: &SagaStep) -> Option<&SharedProcessor> {
        match self {
            Self::Complete => step.completion.as_ref(),
            Self::Compensate => step.compensation.as_ref(),
        }
    }
}

/// Coordinator of one in-memory saga.
pub struct InMemorySagaCoordinator {
    id: String,
    me: Weak<Self>,
    service: Weak<Shared>,
    steps: RwLock<Vec<SagaStep>>,
    state: Mutex<SagaState>,
    /// Cancels step timeout timers; child of the service's shutdown token.
    timers: CancellationToken,
}

impl InMemorySagaCoordinator {
    /// Number of enrolled steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }

    fn retry_settings(&self) -> (u32, Duration) {
        self.service.upgrade().map_or((0, Duration::ZERO), |shared| {
            let config = shared.config.read();
            (config.max_retry_attempts, config.retry_delay())
        })
    }

    fn spawn_timeout(&self, timeout: Duration) {
        let me = self.me.clone();
        let cancelled = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {}
                () = cancelled.cancelled() => return,
            }
            let Some(saga) = me.upgrade() else { return };
            if saga.state() != SagaState::Pending {
                return;
            }
            warn!(saga_id = %saga.id, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "saga step timed out, compensating");
            if let Err(e) = saga.compensate(&Exchange::in_only(Value::Null)).await {
                warn!(saga_id = %saga.id, error = %e, "timed out saga compensation failed");
            }
        });
    }

    /// Runs one action on its own copy of the exchange, retrying on failure.
    async fn run_action(&self, action: &SharedProcessor, exchange: &Exchange) -> Result<(), ExchangeError> {
        let (retries, delay) = self.retry_settings();
        let mut attempt = 0;
        loop {
            let mut action_exchange = exchange.copy();
            action_exchange.take_exception();
            action_exchange
                .message_mut()
                .set_header(properties::SAGA_LONG_RUNNING_ACTION, self.id.clone());
            action_exchange.set_property(properties::SAGA_LONG_RUNNING_ACTION, self.id.clone());

            let out = action.process(action_exchange).await;
            let Some(error) = out.exception() else {
                return Ok(());
            };
            if attempt >= retries {
                return Err(error.clone());
            }
            attempt += 1;
            debug!(saga_id = %self.id, action = action.name(), attempt, error = %error, "retrying saga action");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.timers.cancelled() => return Err(error.clone()),
            }
        }
    }

    async fn finish(&self, phase: Phase, exchange: &Exchange) -> Result<(), SagaError> {
        {
            let mut state = self.state.lock();
            if *state != SagaState::Pending {
                return Err(SagaError::NotPending {
                    saga_id: self.id.clone(),
                    state: *state,
                });
            }
            *state = phase.running();
        }

        let steps = self.steps.read().clone();
        let mut failures = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            let Some(action) = phase.action(step) else {
                continue;
            };
            if let Err(error) = self.run_action(action, exchange).await {
                warn!(saga_id = %self.id, step = index, phase = phase.label(), error = %error, "saga action failed");
                failures.push(StepFailure { step: index, error });
            }
        }

        let outcome = if failures.is_empty() {
            phase.done()
        } else {
            SagaState::Failed
        };
        *self.state.lock() = outcome;
        self.timers.cancel();
        if let Some(shared) = self.service.upgrade() {
            shared.sagas.remove(&self.id);
        }
        metrics::counter!("conduit_saga_transitions_total", "outcome" => outcome.as_str()).increment(1);
        info!(saga_id = %self.id, steps = steps.len(), outcome = %outcome, "saga finished");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SagaError::ActionsFailed {
                saga_id: self.id.clone(),
                phase: phase.label(),
                failures,
            })
        }
    }
}

#[async_trait]
impl SagaCoordinator for InMemorySagaCoordinator {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SagaState {
        *self.state.lock()
    }

    async fn begin_step(&self, step: SagaStep) -> Result<(), SagaError> {
        let state = self.state.lock();
        if *state != SagaState::Pending {
            return Err(SagaError::NotPending {
                saga_id: self.id.clone(),
                state: *state,
            });
        }
        let timeout = step.timeout;
        self.steps.write().push(step);
        drop(state);

        if let Some(timeout) = timeout {
            self.spawn_timeout(timeout);
        }
        Ok(())
    }

    async fn complete(&self, exchange: &Exchange) -> Result<(), SagaError> {
        self.finish(Phase::Complete, exchange).await
    }

    async fn compensate(&self, exchange: &Exchange) -> Result<(), SagaError> {
        self.finish(Phase::Compensate, exchange).await
    }
}
