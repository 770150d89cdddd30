//! Engine configuration types.
//!
//! Plain structs with `Default` impls. Every struct deserializes with
//! `#[serde(default)]`, so an outer configuration layer only has to supply
//! the fields it wants to override.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration for an [`EngineContext`](crate::context::EngineContext).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of this engine instance, used in logs.
    pub name: String,
    /// Per-route limit on concurrently admitted exchanges. `None` disables
    /// admission control.
    pub max_concurrent_exchanges: Option<usize>,
    /// Maximum time a stopping route waits for in-flight exchanges.
    pub drain_timeout_ms: u64,
    /// Restart supervision for routes that fail to start.
    pub supervisor: SupervisorConfig,
    /// In-memory saga service settings.
    pub saga: SagaConfig,
}

impl EngineConfig {
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            max_concurrent_exchanges: None,
            drain_timeout_ms: 30_000,
            supervisor: SupervisorConfig::default(),
            saga: SagaConfig::default(),
        }
    }
}

/// Route restart supervision settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often the supervisor checks for due restarts.
    pub tick_interval_ms: u64,
    /// Delay before the first restart attempt.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the restart delay.
    pub max_delay_ms: u64,
    /// Attempts before a route is reported as exhausted. `0` means unlimited.
    pub max_attempts: u32,
}

impl SupervisorConfig {
    /// Delay before restart attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            initial_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// In-memory saga service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Retries for a failing completion or compensation action.
    pub max_retry_attempts: u32,
    /// Delay between action retries.
    pub retry_delay_ms: u64,
}

impl SagaConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            retry_delay_ms: 5_000,
        }
    }
}
