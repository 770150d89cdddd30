//! Key expressions: opaque functions deriving a string key from an exchange.
//!
//! Used for idempotency keys and sticky correlation. Any
//! `Fn(&Exchange) -> Option<String>` closure is an expression; the helpers
//! below cover the common header/property/body lookups.

use std::fmt;
use std::sync::Arc;

use conduit_core::Exchange;

/// Derives a key from an exchange. `None` means no key could be derived.
pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Option<String>;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Option<String> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Option<String> {
        self(exchange)
    }
}

/// Shared, type-erased expression.
pub type SharedExpression = Arc<dyn Expression>;

struct HeaderExpression(String);

impl Expression for HeaderExpression {
    fn evaluate(&self, exchange: &Exchange) -> Option<String> {
        exchange.message().header(&self.0).and_then(conduit_core::Value::to_key)
    }
}

impl fmt::Debug for HeaderExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "header({})", self.0)
    }
}

/// Value of the named header on the current message.
pub fn header(name: impl Into<String>) -> SharedExpression {
    Arc::new(HeaderExpression(name.into()))
}

/// Value of the named exchange property.
pub fn property(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    Arc::new(move |ex: &Exchange| ex.property(&name).and_then(conduit_core::Value::to_key))
}

/// Scalar body of the current message.
#[must_use]
pub fn body() -> SharedExpression {
    Arc::new(|ex: &Exchange| ex.message().body.to_key())
}

/// A fixed key, regardless of the exchange.
pub fn constant(value: impl Into<String>) -> SharedExpression {
    let value = value.into();
    Arc::new(move |_: &Exchange| Some(value.clone()))
}
