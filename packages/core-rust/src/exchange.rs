//! The exchange: the unit of work carried through a processor chain.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::error::ExchangeError;
use crate::types::Value;

/// Well-known exchange property names.
///
/// Properties carry cross-cutting state for the lifetime of an exchange
/// without polluting message headers.
pub mod properties {
    /// Id of the saga the exchange currently participates in.
    pub const SAGA_LONG_RUNNING_ACTION: &str = "LongRunningAction";
    /// Number of redeliveries performed so far by the innermost error handler.
    pub const REDELIVERY_COUNTER: &str = "RedeliveryCounter";
    /// `true` once the exchange has been redelivered at least once.
    pub const REDELIVERED: &str = "Redelivered";
    /// Maximum redeliveries configured on the handler (absent when unlimited).
    pub const REDELIVERY_MAX_COUNTER: &str = "RedeliveryMaxCounter";
    /// Set by a dead-letter handoff: `true` when the dead-letter destination
    /// handled the failure.
    pub const FAILURE_HANDLED: &str = "FailureHandled";
    /// Name of the error handler that dead-lettered the exchange.
    pub const FAILURE_HANDLER: &str = "FailureHandler";
    /// Set on exchanges an idempotent gate identified as duplicates.
    pub const DUPLICATE_MESSAGE: &str = "DuplicateMessage";
    /// When `true`, a chain stops after the current step without failing.
    pub const ROUTE_STOP: &str = "RouteStop";
    /// Id of the exchange a copy was created from.
    pub const CORRELATION_ID: &str = "CorrelationId";
    /// Number of downstreams tried by a failover balancer.
    pub const FAILOVER_ATTEMPTS: &str = "FailoverAttempts";
    /// Id of the route that admitted the exchange.
    pub const ROUTE_ID: &str = "RouteId";
    /// Set when compensating a saga after a failure itself failed; holds the
    /// compensation error while the exception keeps the original failure.
    pub const SAGA_COMPENSATION_FAILURE: &str = "SagaCompensationFailure";
}

/// Message exchange pattern, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire-and-forget: no reply is expected.
    #[default]
    InOnly,
    /// Request-response: the caller expects a reply message.
    InOut,
}

/// A message: an opaque body plus ordered headers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Opaque payload.
    pub body: Value,
    /// Headers ordered by name.
    pub headers: BTreeMap<String, Value>,
}

impl Message {
    /// Creates a message with the given body and no headers.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Builder-style header setter.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Sets a header, returning the previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    /// Removes a header, returning its value.
    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }
}

/// The unit of work flowing through a chain.
///
/// Ownership moves into each step and back out again, so one exchange
/// instance is only ever mutated by one step at a time. Fan-out strategies
/// use [`Exchange::copy`] to give every branch its own instance.
///
/// `Clone` preserves the id and is used for snapshots (redelivery, failover,
/// timeouts); `copy` creates a new, correlated exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    created_at: Instant,
    input: Message,
    output: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<ExchangeError>,
    caught_exception: Option<ExchangeError>,
}

impl Exchange {
    /// Creates an exchange with a fresh process-unique id.
    #[must_use]
    pub fn new(pattern: ExchangePattern, input: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern,
            created_at: Instant::now(),
            input,
            output: None,
            properties: HashMap::new(),
            exception: None,
            caught_exception: None,
        }
    }

    /// Shorthand for a one-way exchange with the given body.
    pub fn in_only(body: impl Into<Value>) -> Self {
        Self::new(ExchangePattern::InOnly, Message::new(body))
    }

    /// Shorthand for a request-response exchange with the given body.
    pub fn in_out(body: impl Into<Value>) -> Self {
        Self::new(ExchangePattern::InOut, Message::new(body))
    }

    /// Creates an independent copy with a fresh id.
    ///
    /// Messages, properties and the exception are deep-copied; the copy's
    /// `CorrelationId` property points at this exchange.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.created_at = Instant::now();
        copy.properties.insert(
            properties::CORRELATION_ID.to_string(),
            Value::String(self.id.clone()),
        );
        copy
    }

    /// The exchange id, immutable for the exchange's lifetime.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    /// When this exchange instance was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // -- messages ----------------------------------------------------------

    #[must_use]
    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    #[must_use]
    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    /// Returns the out-message, creating an empty one if absent.
    pub fn output_mut(&mut self) -> &mut Message {
        self.output.get_or_insert_with(Message::default)
    }

    pub fn set_output(&mut self, message: Message) {
        self.output = Some(message);
    }

    pub fn take_output(&mut self) -> Option<Message> {
        self.output.take()
    }

    /// The message downstream consumers see: the out-message when present,
    /// otherwise the in-message.
    #[must_use]
    pub fn message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    /// Mutable access to the message downstream consumers see.
    pub fn message_mut(&mut self) -> &mut Message {
        match self.output {
            Some(ref mut out) => out,
            None => &mut self.input,
        }
    }

    /// Promotes the out-message (if any) to the in-message before the next
    /// step of a chain runs.
    pub fn prepare_for_next_step(&mut self) {
        if let Some(out) = self.output.take() {
            self.input = out;
        }
    }

    // -- properties --------------------------------------------------------

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    /// Returns a string property.
    #[must_use]
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(Value::as_str)
    }

    /// Returns `true` when the named property holds `Bool(true)`.
    #[must_use]
    pub fn property_flag(&self, name: &str) -> bool {
        self.property(name).and_then(Value::as_bool).unwrap_or(false)
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // -- failure state -----------------------------------------------------

    /// The current failure, if any.
    #[must_use]
    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    /// Marks the exchange failed, replacing any previous failure.
    pub fn set_exception(&mut self, error: ExchangeError) {
        self.exception = Some(error);
    }

    /// Clears and returns the current failure.
    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    /// `true` while an exception is attached.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The failure that was handed to a dead-letter destination.
    #[must_use]
    pub fn caught_exception(&self) -> Option<&ExchangeError> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, error: ExchangeError) {
        self.caught_exception = Some(error);
    }

    /// `true` when a step asked the chain to stop early.
    #[must_use]
    pub fn is_route_stop(&self) -> bool {
        self.property_flag(properties::ROUTE_STOP)
    }
}
