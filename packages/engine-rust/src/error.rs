//! Configuration errors reported synchronously by builders and constructors.

/// Invalid configuration of a mediation primitive.
///
/// Raised while assembling a route, never while processing an exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A load balancer was given no downstream processors.
    #[error("load balancer '{0}' has no downstream processors")]
    EmptyDownstreams(String),
    /// Weight list length differs from the downstream count.
    #[error("expected {expected} weights, got {actual}")]
    WeightMismatch { expected: usize, actual: usize },
    /// All configured weights are zero.
    #[error("at least one weight must be positive")]
    ZeroWeights,
    /// A redelivery policy option is out of range.
    #[error("invalid redelivery policy: {0}")]
    InvalidPolicy(String),
    /// A delay pattern could not be parsed.
    #[error("invalid delay pattern '{pattern}': {reason}")]
    InvalidDelayPattern { pattern: String, reason: String },
    /// No strategy is registered under the requested name.
    #[error("unknown load balancing strategy '{0}'")]
    UnknownStrategy(String),
    /// A required option was not supplied.
    #[error("missing option '{0}'")]
    MissingOption(&'static str),
    /// The file idempotent repository settings are inconsistent.
    #[error("invalid repository configuration: {0}")]
    InvalidRepository(String),
}
