//! The idempotent gate processor.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError};
use tracing::{debug, warn};

use super::{IdempotentRepository, RepositoryError};
use crate::expression::SharedExpression;
use crate::processor::{Processor, SharedProcessor};

fn repository_failure(err: &RepositoryError) -> ExchangeError {
    ExchangeError::Repository(err.to_string())
}

/// Lets each exchange through to `processor` only the first time its key is
/// seen.
///
/// Options:
/// - `eager` (default `true`): record the key before processing; otherwise
///   only check for it and record it after successful processing.
/// - `skip_duplicate` (default `true`): stop duplicates at the gate;
///   otherwise flag them with the `DuplicateMessage` property and process
///   them anyway.
/// - `remove_on_failure` (default `true`): forget the key when processing
///   fails so a redelivery is not treated as a duplicate.
/// - `on_duplicate`: branch that receives duplicates.
pub struct IdempotentConsumer {
    name: String,
    key: SharedExpression,
    repository: Arc<dyn IdempotentRepository>,
    processor: SharedProcessor,
    on_duplicate: Option<SharedProcessor>,
    eager: bool,
    skip_duplicate: bool,
    remove_on_failure: bool,
}

impl IdempotentConsumer {
    pub fn new(
        key: SharedExpression,
        repository: Arc<dyn IdempotentRepository>,
        processor: SharedProcessor,
    ) -> Self {
        Self {
            name: "idempotent-consumer".to_string(),
            key,
            repository,
            processor,
            on_duplicate: None,
            eager: true,
            skip_duplicate: true,
            remove_on_failure: true,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    #[must_use]
    pub fn skip_duplicate(mut self, skip: bool) -> Self {
        self.skip_duplicate = skip;
        self
    }

    #[must_use]
    pub fn remove_on_failure(mut self, remove: bool) -> Self {
        self.remove_on_failure = remove;
        self
    }

    #[must_use]
    pub fn on_duplicate(mut self, processor: SharedProcessor) -> Self {
        self.on_duplicate = Some(processor);
        self
    }

    /// Records the key (eager) or checks for it (lazy). Returns `true` for a
    /// key not seen before.
    async fn admit(&self, key: &str) -> Result<bool, RepositoryError> {
        if self.eager {
            self.repository.add(key).await
        } else {
            Ok(!self.repository.contains(key).await?)
        }
    }

    async fn handle_duplicate(&self, mut exchange: Exchange, key: &str) -> Exchange {
        debug!(gate = %self.name, key, exchange_id = exchange.id(), "duplicate message");
        metrics::counter!("conduit_duplicates_total", "gate" => self.name.clone()).increment(1);
        exchange.set_property(properties::DUPLICATE_MESSAGE, true);

        if let Some(branch) = &self.on_duplicate {
            exchange = branch.process(exchange).await;
        }
        if self.skip_duplicate || exchange.is_failed() {
            return exchange;
        }
        self.processor.process(exchange).await
    }

    /// Post-processing bookkeeping for a newly admitted key.
    async fn settle(&self, mut exchange: Exchange, key: &str) -> Exchange {
        if exchange.is_failed() {
            if self.remove_on_failure && self.eager {
                if let Err(e) = self.repository.remove(key).await {
                    warn!(gate = %self.name, key, error = %e, "failed to remove key after failure");
                }
            }
            return exchange;
        }

        if !self.eager {
            match self.repository.add(key).await {
                Ok(true) => {}
                Ok(false) => debug!(gate = %self.name, key, "key recorded concurrently"),
                Err(e) => {
                    exchange.set_exception(repository_failure(&e));
                    return exchange;
                }
            }
        }
        if let Err(e) = self.repository.confirm(key).await {
            exchange.set_exception(repository_failure(&e));
        }
        exchange
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let Some(key) = self.key.evaluate(&exchange) else {
            let exchange_id = exchange.id().to_string();
            exchange.set_exception(ExchangeError::MissingKey { exchange_id });
            return exchange;
        };

        let is_new = match self.admit(&key).await {
            Ok(is_new) => is_new,
            Err(e) => {
                exchange.set_exception(repository_failure(&e));
                return exchange;
            }
        };

        if !is_new {
            return self.handle_duplicate(exchange, &key).await;
        }

        let exchange = self.processor.process(exchange).await;
        self.settle(exchange, &key).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
