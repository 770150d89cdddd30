//! Saga coordination: multi-step transactions completed or compensated as a
//! whole.
//!
//! A [`SagaService`] is the explicit registry of live sagas. Each saga is
//! driven by a [`SagaCoordinator`]; steps enrol a [`SagaStep`] (completion
//! and compensation actions) while the saga is pending, and the boundary
//! step (see [`SagaProcessor`]) later asks the coordinator to complete or
//! compensate every enrolled step.

pub mod in_memory;
pub mod processor;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{Exchange, ExchangeError};

pub use in_memory::{InMemorySagaCoordinator, InMemorySagaService};
pub use processor::{SagaAction, SagaActionProcessor, SagaCompletionMode, SagaProcessor, SagaPropagation};

use crate::processor::SharedProcessor;

/// Lifecycle state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    /// Accepting new steps.
    Pending,
    Completing,
    Compensating,
    Completed,
    Compensated,
    /// At least one action failed after its retries.
    Failed,
}

impl SagaState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completing => "completing",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enrolled participant of a saga.
#[derive(Clone, Default)]
pub struct SagaStep {
    pub completion: Option<SharedProcessor>,
    pub compensation: Option<SharedProcessor>,
    /// Compensates the whole saga if it is still pending when this elapses.
    pub timeout: Option<Duration>,
}

impl SagaStep {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_completion(mut self, action: SharedProcessor) -> Self {
        self.completion = Some(action);
        self
    }

    #[must_use]
    pub fn with_compensation(mut self, action: SharedProcessor) -> Self {
        self.compensation = Some(action);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("completion", &self.completion.as_ref().map(|p| p.name().to_string()))
            .field("compensation", &self.compensation.as_ref().map(|p| p.name().to_string()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Action that failed while completing or compensating a saga.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    /// Enrollment index of the step.
    pub step: usize,
    pub error: ExchangeError,
}

/// Errors returned by saga coordinators and services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SagaError {
    /// The saga already left the pending state.
    #[error("saga {saga_id} is {state}, not pending")]
    NotPending { saga_id: String, state: SagaState },
    /// Completion or compensation ran every action but some failed.
    #[error("saga {saga_id}: {} {phase} action(s) failed", .failures.len())]
    ActionsFailed {
        saga_id: String,
        phase: &'static str,
        failures: Vec<StepFailure>,
    },
    /// The saga service has been shut down.
    #[error("saga service is stopped")]
    ServiceStopped,
}

impl SagaError {
    /// Converts the error into the failure recorded on an exchange.
    #[must_use]
    pub fn into_exchange_error(self, saga_id: &str) -> ExchangeError {
        ExchangeError::Saga {
            saga_id: saga_id.to_string(),
            message: self.to_string(),
        }
    }
}

/// Drives one saga.
#[async_trait]
pub trait SagaCoordinator: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> SagaState;

    /// Enrols a step. Only allowed while the saga is pending.
    async fn begin_step(&self, step: SagaStep) -> Result<(), SagaError>;

    /// Runs every completion action in enrollment order. A failing action
    /// does not stop the others; failures are reported together.
    async fn complete(&self, exchange: &Exchange) -> Result<(), SagaError>;

    /// Same as [`complete`](Self::complete) for compensation actions.
    async fn compensate(&self, exchange: &Exchange) -> Result<(), SagaError>;
}

pub type SharedCoordinator = Arc<dyn SagaCoordinator>;

/// Registry of live sagas.
#[async_trait]
pub trait SagaService: Send + Sync {
    /// Creates and registers a new pending saga.
    async fn new_saga(&self) -> Result<SharedCoordinator, SagaError>;

    /// Looks up a live saga. Terminal sagas are no longer registered.
    async fn get_saga(&self, id: &str) -> Option<SharedCoordinator>;
}
