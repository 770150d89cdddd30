//! Per-invocation redelivery bookkeeping.

use std::time::Duration;

use conduit_core::ExchangeError;
use tokio::time::Instant;

/// Position of one exchange in the error handler's state machine.
///
/// `Attempting` moves to `Succeeded`, `RetryScheduled` (and back to
/// `Attempting` once the delay passes), `DeadLettered`, or `Failed` when the
/// failure is surfaced without a dead-letter handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Attempting,
    RetryScheduled,
    Succeeded,
    DeadLettered,
    Failed,
}

impl HandlerState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Failed)
    }

    /// Whether the machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: HandlerState) -> bool {
        matches!(
            (self, next),
            (
                Self::Attempting,
                Self::Succeeded | Self::RetryScheduled | Self::DeadLettered | Self::Failed
            ) | (Self::RetryScheduled, Self::Attempting | Self::Failed)
        )
    }
}

/// Redelivery state owned by one handler invocation.
///
/// Lives on the handler's stack for the duration of one exchange, so it is
/// discarded when the exchange leaves the handler.
#[derive(Debug, Clone)]
pub struct RedeliveryState {
    /// Redeliveries performed so far (the first attempt is not counted).
    pub counter: u32,
    /// When the most recent failure was observed.
    pub last_failure_at: Option<Instant>,
    /// The most recent failure.
    pub last_error: Option<ExchangeError>,
    /// Delay used before the most recent redelivery.
    pub previous_delay: Duration,
    pub phase: HandlerState,
}

impl Default for RedeliveryState {
    fn default() -> Self {
        Self {
            counter: 0,
            last_failure_at: None,
            last_error: None,
            previous_delay: Duration::ZERO,
            phase: HandlerState::Attempting,
        }
    }
}

impl RedeliveryState {
    pub fn record_failure(&mut self, error: ExchangeError) {
        self.last_failure_at = Some(Instant::now());
        self.last_error = Some(error);
    }

    /// Moves to `next`; an illegal transition is logged and ignored.
    pub fn transition(&mut self, next: HandlerState) {
        if self.phase.can_transition_to(next) {
            self.phase = next;
        } else {
            tracing::error!(from = ?self.phase, to = ?next, "illegal error handler transition");
        }
    }

    /// Records a scheduled redelivery.
    pub fn schedule(&mut self, delay: Duration) {
        self.transition(HandlerState::RetryScheduled);
        self.counter += 1;
        self.previous_delay = delay;
    }
}
