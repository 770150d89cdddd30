//! Sequential processor chain.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::Exchange;
use tracing::{debug, trace};

use super::{Processor, SharedProcessor};

/// A fixed sequence of steps executed one after another.
///
/// Step `i + 1` starts only after step `i` has handed the exchange back.
/// Between steps an out-message is promoted to the in-message. The chain
/// stops at the first step that leaves an exception on the exchange, handing
/// control to the nearest enclosing error handler (or the caller), and stops
/// without failing when a step sets the `RouteStop` property.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Arc<[SharedProcessor]>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<SharedProcessor>) -> Self {
        Self {
            name: name.into(),
            steps: steps.into(),
        }
    }

    /// Number of steps in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                exchange.prepare_for_next_step();
            }
            trace!(pipeline = %self.name, step = step.name(), exchange_id = exchange.id(), "entering step");
            exchange = step.process(exchange).await;

            if exchange.is_failed() {
                debug!(
                    pipeline = %self.name,
                    step = step.name(),
                    exchange_id = exchange.id(),
                    "step failed, abandoning remaining steps"
                );
                break;
            }
            if exchange.is_route_stop() {
                debug!(pipeline = %self.name, step = step.name(), "route stop requested");
                break;
            }
        }
        exchange
    }

    fn name(&self) -> &str {
        &self.name
    }
}
