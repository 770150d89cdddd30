//! Redelivery and dead-letter handling around a processor.
//!
//! [`RedeliveryErrorHandler`] runs its wrapped processor, evaluates every
//! failure against a [`RedeliveryPolicy`], waits on a timer between
//! redeliveries and finally hands exhausted exchanges to an optional
//! dead-letter destination.

pub mod policy;
pub mod state;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError};
use tracing::{debug, info, warn};

pub use policy::{Backoff, DelayPattern, RedeliveryDecision, RedeliveryPolicy, RetryPredicate};
pub use state::{HandlerState, RedeliveryState};

use crate::error::ConfigError;
use crate::processor::{Processor, SharedProcessor};
use crate::route::drain::StopSignal;

/// Destination for exchanges that exhausted redelivery.
#[derive(Clone)]
pub struct DeadLetterChannel {
    processor: SharedProcessor,
    use_original_message: bool,
}

impl DeadLetterChannel {
    #[must_use]
    pub fn new(processor: SharedProcessor) -> Self {
        Self {
            processor,
            use_original_message: false,
        }
    }

    /// Hand over the exchange as it entered the handler instead of its
    /// failed state.
    #[must_use]
    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }
}

/// Error handler wrapping a processor.
///
/// Every redelivery replays the exchange as it entered the handler, marked
/// with the `RedeliveryCounter`, `Redelivered` and `RedeliveryMaxCounter`
/// properties; the properties are removed again when a redelivery succeeds.
///
/// Once the policy denies another attempt, the exchange goes to the
/// dead-letter destination with the failure moved to its caught-exception
/// slot. If the destination succeeds the failure stays cleared and
/// `FailureHandled` is `true`; otherwise the original failure is restored
/// and surfaced. Without a destination the failure is surfaced as is.
///
/// Configuration and rejection failures bypass both redelivery and the
/// dead-letter destination.
pub struct RedeliveryErrorHandler {
    name: String,
    inner: SharedProcessor,
    policy: RedeliveryPolicy,
    dead_letter: Option<DeadLetterChannel>,
    on_redelivery: Option<SharedProcessor>,
    stop_signal: Option<StopSignal>,
}

impl RedeliveryErrorHandler {
    /// # Errors
    ///
    /// Returns the policy's validation error.
    pub fn new(inner: SharedProcessor, policy: RedeliveryPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            name: format!("error-handler({})", inner.name()),
            inner,
            policy,
            dead_letter: None,
            on_redelivery: None,
            stop_signal: None,
        })
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn dead_letter(mut self, channel: DeadLetterChannel) -> Self {
        self.dead_letter = Some(channel);
        self
    }

    /// Processor run on the exchange before each redelivery.
    #[must_use]
    pub fn on_redelivery(mut self, hook: SharedProcessor) -> Self {
        self.on_redelivery = Some(hook);
        self
    }

    /// Ties the handler to a route's stop flag.
    #[must_use]
    pub fn with_stop_signal(mut self, signal: StopSignal) -> Self {
        self.stop_signal = Some(signal);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    fn is_stopping(&self) -> bool {
        self.stop_signal.as_ref().is_some_and(StopSignal::is_stopping)
    }

    /// Waits out the redelivery delay. Returns `false` when the route began
    /// stopping and redelivery is not allowed to continue.
    async fn wait(&self, delay: Duration) -> bool {
        let allow = self.policy.allow_redelivery_while_stopping;
        match (&self.stop_signal, allow) {
            (Some(signal), false) => {
                let mut signal = signal.clone();
                tokio::select! {
                    () = tokio::time::sleep(delay) => true,
                    () = signal.stopped() => false,
                }
            }
            _ => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    fn refuse_while_stopping(&self, mut exchange: Exchange, state: &mut RedeliveryState) -> Exchange {
        warn!(handler = %self.name, exchange_id = exchange.id(), "route stopping, redelivery refused");
        state.transition(HandlerState::Failed);
        exchange.set_exception(ExchangeError::rejected("route is stopping; redelivery refused"));
        exchange
    }

    /// Builds the exchange for the next redelivery from the entry snapshot.
    fn prepare_redelivery(&self, original: &Exchange, counter: u32) -> Exchange {
        let mut next = original.clone();
        next.set_property(properties::REDELIVERY_COUNTER, i64::from(counter));
        next.set_property(properties::REDELIVERED, true);
        if let Some(max) = self.policy.max_counter() {
            next.set_property(properties::REDELIVERY_MAX_COUNTER, max);
        }
        next
    }

    fn clear_redelivery_marks(exchange: &mut Exchange) {
        exchange.remove_property(properties::REDELIVERY_COUNTER);
        exchange.remove_property(properties::REDELIVERED);
        exchange.remove_property(properties::REDELIVERY_MAX_COUNTER);
    }

    async fn hand_to_dead_letter(
        &self,
        mut failed: Exchange,
        original: &Exchange,
        state: &mut RedeliveryState,
    ) -> Exchange {
        let Some(channel) = &self.dead_letter else {
            state.transition(HandlerState::Failed);
            return failed;
        };
        let Some(error) = failed.take_exception() else {
            return failed;
        };

        state.transition(HandlerState::DeadLettered);
        metrics::counter!("conduit_dead_letters_total", "handler" => self.name.clone()).increment(1);
        warn!(
            handler = %self.name,
            exchange_id = failed.id(),
            redeliveries = state.counter,
            error = %error,
            "dead-lettering exchange"
        );

        let mut target = if channel.use_original_message {
            original.clone()
        } else {
            failed
        };
        target.set_caught_exception(error.clone());
        target.set_property(properties::REDELIVERY_COUNTER, i64::from(state.counter));
        target.set_property(properties::FAILURE_HANDLER, self.name.clone());

        let mut out = channel.processor.process(target).await;
        if let Some(dlc_error) = out.exception() {
            warn!(handler = %self.name, error = %dlc_error, "dead-letter destination failed");
            out.set_exception(error);
            out.set_property(properties::FAILURE_HANDLED, false);
        } else {
            out.set_property(properties::FAILURE_HANDLED, true);
        }
        out
    }
}

impl fmt::Debug for RedeliveryErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryErrorHandler")
            .field("name", &self.name)
            .field("inner", &self.inner.name())
            .field("policy", &self.policy)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let original = exchange.clone();
        let entered = tokio::time::Instant::now();
        let mut state = RedeliveryState::default();

        let mut current = self.inner.process(exchange).await;
        loop {
            let Some(error) = current.exception().cloned() else {
                state.transition(HandlerState::Succeeded);
                if state.counter > 0 {
                    debug!(handler = %self.name, redeliveries = state.counter, "redelivery succeeded");
                    Self::clear_redelivery_marks(&mut current);
                }
                return current;
            };
            state.record_failure(error.clone());

            match self.policy.decide(&current, &error, &state, entered.elapsed()) {
                RedeliveryDecision::Redeliver { delay } => {
                    if self.is_stopping() && !self.policy.allow_redelivery_while_stopping {
                        return self.refuse_while_stopping(current, &mut state);
                    }
                    state.schedule(delay);
                    metrics::counter!("conduit_redeliveries_total", "handler" => self.name.clone())
                        .increment(1);
                    info!(
                        handler = %self.name,
                        exchange_id = current.id(),
                        attempt = state.counter,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "scheduling redelivery"
                    );

                    if !self.wait(delay).await {
                        return self.refuse_while_stopping(current, &mut state);
                    }
                    state.transition(HandlerState::Attempting);

                    let mut next = self.prepare_redelivery(&original, state.counter);
                    if let Some(hook) = &self.on_redelivery {
                        next = hook.process(next).await;
                        if next.is_failed() {
                            current = next;
                            continue;
                        }
                    }
                    current = self.inner.process(next).await;
                }
                RedeliveryDecision::Fatal => {
                    debug!(handler = %self.name, error = %error, "fatal failure, not handled");
                    state.transition(HandlerState::Failed);
                    return current;
                }
                RedeliveryDecision::Exhausted | RedeliveryDecision::NotRetryable => {
                    return self.hand_to_dead_letter(current, &original, &mut state).await;
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
