//! Saga boundary and action steps.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError, Value};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SagaCoordinator, SagaService, SagaStep, SharedCoordinator};
use crate::processor::{Processor, SharedProcessor};

/// How a boundary step relates to a saga already carried by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SagaPropagation {
    /// Join the current saga, or start one if there is none.
    #[default]
    Required,
    /// Always start a new saga; the current one is restored afterwards.
    RequiresNew,
    /// Join the current saga; fail if there is none.
    Mandatory,
    /// Join the current saga if there is one, otherwise run without.
    Supports,
    /// Run outside any saga; the current one is restored afterwards.
    NotSupported,
    /// Fail if the exchange carries a saga.
    Never,
}

/// Who decides the outcome of a saga this step starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SagaCompletionMode {
    /// Complete on success, compensate on failure, once the wrapped
    /// processor returns.
    #[default]
    Auto,
    /// Leave the saga pending for a later [`SagaActionProcessor`].
    Manual,
}

/// Step that opens or joins a saga around a wrapped processor.
pub struct SagaProcessor {
    name: String,
    service: Arc<dyn SagaService>,
    inner: SharedProcessor,
    step: SagaStep,
    propagation: SagaPropagation,
    completion: SagaCompletionMode,
}

impl SagaProcessor {
    pub fn new(service: Arc<dyn SagaService>, inner: SharedProcessor) -> Self {
        Self {
            name: format!("saga({})", inner.name()),
            service,
            inner,
            step: SagaStep::default(),
            propagation: SagaPropagation::default(),
            completion: SagaCompletionMode::default(),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Completion and compensation actions this step enrols.
    #[must_use]
    pub fn step(mut self, step: SagaStep) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub fn propagation(mut self, propagation: SagaPropagation) -> Self {
        self.propagation = propagation;
        self
    }

    #[must_use]
    pub fn completion_mode(mut self, mode: SagaCompletionMode) -> Self {
        self.completion = mode;
        self
    }

    fn fail(mut exchange: Exchange, error: ExchangeError) -> Exchange {
        exchange.set_exception(error);
        exchange
    }

    fn set_saga(exchange: &mut Exchange, saga_id: Option<Value>) {
        match saga_id {
            Some(id) => {
                exchange.set_property(properties::SAGA_LONG_RUNNING_ACTION, id);
            }
            None => {
                exchange.remove_property(properties::SAGA_LONG_RUNNING_ACTION);
            }
        }
    }

    /// Enrols this step in `saga` and runs the wrapped processor inside it.
    async fn join(&self, mut exchange: Exchange, saga: SharedCoordinator) -> Exchange {
        if let Err(e) = saga.begin_step(self.step.clone()).await {
            return Self::fail(exchange, e.into_exchange_error(saga.id()));
        }
        exchange.set_property(properties::SAGA_LONG_RUNNING_ACTION, saga.id().to_string());
        self.inner.process(exchange).await
    }

    /// Starts a saga, runs the wrapped processor in it and, in auto mode,
    /// completes or compensates it.
    async fn run_new(&self, exchange: Exchange) -> Exchange {
        let previous = exchange.property(properties::SAGA_LONG_RUNNING_ACTION).cloned();
        let saga = match self.service.new_saga().await {
            Ok(saga) => saga,
            Err(e) => return Self::fail(exchange, ExchangeError::Configuration(e.to_string())),
        };
        debug!(step = %self.name, saga_id = saga.id(), "saga started");

        let mut exchange = self.join(exchange, Arc::clone(&saga)).await;
        if self.completion == SagaCompletionMode::Manual {
            return exchange;
        }

        if exchange.is_failed() {
            if let Err(e) = saga.compensate(&exchange).await {
                warn!(step = %self.name, saga_id = saga.id(), error = %e, "saga compensation failed");
                exchange.set_property(properties::SAGA_COMPENSATION_FAILURE, e.to_string());
            }
        } else if let Err(e) = saga.complete(&exchange).await {
            exchange.set_exception(e.into_exchange_error(saga.id()));
        }
        Self::set_saga(&mut exchange, previous);
        exchange
    }

    /// Runs the wrapped processor with the saga property detached.
    async fn run_outside(&self, mut exchange: Exchange) -> Exchange {
        let previous = exchange.remove_property(properties::SAGA_LONG_RUNNING_ACTION);
        let mut out = self.inner.process(exchange).await;
        Self::set_saga(&mut out, previous);
        out
    }
}

/// Resolves the saga named by the exchange's saga property.
///
/// `Ok(None)` when the exchange carries no saga; an id without a registered
/// coordinator is a configuration failure.
async fn current_saga(
    service: &dyn SagaService,
    exchange: &Exchange,
) -> Result<Option<SharedCoordinator>, ExchangeError> {
    let Some(id) = exchange.property_str(properties::SAGA_LONG_RUNNING_ACTION) else {
        return Ok(None);
    };
    match service.get_saga(id).await {
        Some(saga) => Ok(Some(saga)),
        None => Err(ExchangeError::Configuration(format!(
            "no saga coordinator registered for id {id}"
        ))),
    }
}

#[async_trait]
impl Processor for SagaProcessor {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let current = match self.propagation {
            SagaPropagation::RequiresNew | SagaPropagation::NotSupported => None,
            _ => match current_saga(self.service.as_ref(), &exchange).await {
                Ok(current) => current,
                Err(e) => return Self::fail(exchange, e),
            },
        };

        match (self.propagation, current) {
            (SagaPropagation::RequiresNew, _) => self.run_new(exchange).await,
            (SagaPropagation::NotSupported, _) => self.run_outside(exchange).await,
            (SagaPropagation::Required | SagaPropagation::Mandatory | SagaPropagation::Supports, Some(saga)) => {
                self.join(exchange, saga).await
            }
            (SagaPropagation::Required, None) => self.run_new(exchange).await,
            (SagaPropagation::Mandatory, None) => Self::fail(
                exchange,
                ExchangeError::Configuration(format!("{} requires an active saga", self.name)),
            ),
            (SagaPropagation::Never, Some(saga)) => Self::fail(
                exchange,
                ExchangeError::Configuration(format!(
                    "{} must not run inside saga {}",
                    self.name,
                    saga.id()
                )),
            ),
            (SagaPropagation::Supports | SagaPropagation::Never, None) => self.inner.process(exchange).await,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Explicit outcome for a manually completed saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SagaAction {
    Complete,
    Compensate,
}

/// Completes or compensates the saga carried by the exchange.
pub struct SagaActionProcessor {
    service: Arc<dyn SagaService>,
    action: SagaAction,
}

impl SagaActionProcessor {
    pub fn new(service: Arc<dyn SagaService>, action: SagaAction) -> Self {
        Self { service, action }
    }
}

#[async_trait]
impl Processor for SagaActionProcessor {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let saga = match current_saga(self.service.as_ref(), &exchange).await {
            Ok(Some(saga)) => saga,
            Ok(None) => {
                exchange.set_exception(ExchangeError::Configuration(
                    "exchange carries no saga to finish".into(),
                ));
                return exchange;
            }
            Err(e) => {
                exchange.set_exception(e);
                return exchange;
            }
        };

        let result = match self.action {
            SagaAction::Complete => saga.complete(&exchange).await,
            SagaAction::Compensate => saga.compensate(&exchange).await,
        };
        if let Err(e) = result {
            exchange.set_exception(e.into_exchange_error(saga.id()));
        }
        exchange
    }

    fn name(&self) -> &str {
        match self.action {
            SagaAction::Complete => "saga-complete",
            SagaAction::Compensate => "saga-compensate",
        }
    }
}
