//! Failure values carried on an exchange.
//!
//! A step never lets a failure escape its own completion: every failure is
//! stored in the exchange's exception slot as an [`ExchangeError`] and
//! inspected by the enclosing error handler or the original caller.

/// Failure attached to an exchange.
///
/// Cloneable so fan-out copies and redelivery snapshots can carry it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Failure raised by a processing step. `kind` classifies the failure for
    /// redelivery allow/deny lists and failover exception filters.
    #[error("{kind}: {message}")]
    Processing { kind: String, message: String },
    /// A timeout wrapper expired before the wrapped step completed.
    #[error("exchange timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// Misconfiguration detected while processing (missing saga coordinator,
    /// out-of-range custom selection, ...). Never redelivered.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No idempotency key could be derived from the exchange.
    #[error("no idempotency key for exchange {exchange_id}")]
    MissingKey { exchange_id: String },
    /// The idempotent repository or another backing store failed.
    #[error("repository error: {0}")]
    Repository(String),
    /// The exchange was not admitted (route not started, overloaded, or
    /// redelivery refused while stopping). Never redelivered.
    #[error("exchange rejected: {reason}")]
    Rejected { reason: String },
    /// Saga completion or compensation failed.
    #[error("saga {saga_id} failed: {message}")]
    Saga { saga_id: String, message: String },
}

impl ExchangeError {
    /// Kind name used by processing failures raised without a specific kind.
    pub const GENERIC_KIND: &'static str = "ProcessingError";

    /// Creates a processing failure of the given kind.
    pub fn processing(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a processing failure without a specific kind.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::processing(Self::GENERIC_KIND, message)
    }

    /// Creates a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns the classification name of this failure.
    ///
    /// Processing failures report their own kind; every other variant reports
    /// a fixed name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Processing { kind, .. } => kind,
            Self::Timeout { .. } => "Timeout",
            Self::Configuration(_) => "Configuration",
            Self::MissingKey { .. } => "MissingKey",
            Self::Repository(_) => "Repository",
            Self::Rejected { .. } => "Rejected",
            Self::Saga { .. } => "Saga",
        }
    }

    /// Returns `true` for failures that no retry can fix.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Rejected { .. })
    }
}
