//! Redelivery policy: when to retry, and how long to wait.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{Exchange, ExchangeError};
use rand::Rng;

use super::state::RedeliveryState;
use crate::error::ConfigError;

/// Predicate consulted before every redelivery; `false` stops retrying.
pub type RetryPredicate = Arc<dyn Fn(&Exchange, &ExchangeError) -> bool + Send + Sync>;

/// Delay growth between redeliveries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Every redelivery waits the initial delay.
    Fixed,
    /// Each delay is the previous one times `multiplier`.
    Exponential { multiplier: f64 },
}

/// Stepwise delays keyed by redelivery count, written `limit:delay;...`.
///
/// Redelivery `n` waits the delay of the last group whose limit is at most
/// `n`; before the first limit there is no delay. `"3:1000;5:5000"` waits
/// nothing for redeliveries 1-2, one second for 3-4 and five seconds from the
/// fifth on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPattern {
    groups: Vec<(u32, Duration)>,
}

impl DelayPattern {
    #[must_use]
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        self.groups
            .iter()
            .take_while(|(limit, _)| *limit <= redelivery)
            .last()
            .map_or(Duration::ZERO, |(_, delay)| *delay)
    }
}

impl FromStr for DelayPattern {
    type Err = ConfigError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidDelayPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut groups = Vec::new();
        for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (limit, delay) = group
                .split_once(':')
                .ok_or_else(|| invalid("expected limit:delay"))?;
            let limit: u32 = limit.trim().parse().map_err(|_| invalid("limit is not a number"))?;
            let delay: u64 = delay.trim().parse().map_err(|_| invalid("delay is not a number"))?;
            if groups.last().is_some_and(|(prev, _)| *prev >= limit) {
                return Err(invalid("limits must increase"));
            }
            groups.push((limit, Duration::from_millis(delay)));
        }
        if groups.is_empty() {
            return Err(invalid("no groups"));
        }
        Ok(Self { groups })
    }
}

/// Outcome of evaluating a failure against the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RedeliveryDecision {
    /// Retry after `delay`.
    Redeliver { delay: Duration },
    /// Redelivery budget (count or elapsed time) is used up, or the
    /// `retry_while` predicate declined.
    Exhausted,
    /// The failure kind is excluded from redelivery.
    NotRetryable,
    /// Configuration or admission failure; never retried or dead-lettered.
    Fatal,
}

/// Redelivery settings for a [`RedeliveryErrorHandler`](super::RedeliveryErrorHandler).
///
/// Defaults: no redeliveries, 1 s initial delay, fixed backoff capped at
/// 60 s, every non-fatal failure kind eligible.
#[derive(Clone)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: i32,
    pub redelivery_delay: Duration,
    pub backoff: Backoff,
    pub maximum_redelivery_delay: Duration,
    pub collision_avoidance_factor: Option<f64>,
    pub delay_pattern: Option<DelayPattern>,
    pub retry_on: Vec<String>,
    pub never_retry_on: Vec<String>,
    pub retry_while: Option<RetryPredicate>,
    pub maximum_elapsed: Option<Duration>,
    pub allow_redelivery_while_stopping: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            maximum_redelivery_delay: Duration::from_secs(60),
            collision_avoidance_factor: None,
            delay_pattern: None,
            retry_on: Vec::new(),
            never_retry_on: Vec::new(),
            retry_while: None,
            maximum_elapsed: None,
            allow_redelivery_while_stopping: false,
        }
    }
}

impl fmt::Debug for RedeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryPolicy")
            .field("maximum_redeliveries", &self.maximum_redeliveries)
            .field("redelivery_delay", &self.redelivery_delay)
            .field("backoff", &self.backoff)
            .field("maximum_redelivery_delay", &self.maximum_redelivery_delay)
            .field("collision_avoidance_factor", &self.collision_avoidance_factor)
            .field("delay_pattern", &self.delay_pattern)
            .field("retry_on", &self.retry_on)
            .field("never_retry_on", &self.never_retry_on)
            .field("retry_while", &self.retry_while.is_some())
            .field("maximum_elapsed", &self.maximum_elapsed)
            .field("allow_redelivery_while_stopping", &self.allow_redelivery_while_stopping)
            .finish()
    }
}

impl RedeliveryPolicy {
    /// Redeliveries after the first attempt. Negative means unlimited.
    #[must_use]
    pub fn maximum_redeliveries(mut self, redeliveries: i32) -> Self {
        self.maximum_redeliveries = redeliveries;
        self
    }

    /// Total attempts including the first one.
    #[must_use]
    pub fn maximum_attempts(self, attempts: u32) -> Self {
        let redeliveries = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        self.maximum_redeliveries(redeliveries)
    }

    #[must_use]
    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    #[must_use]
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.backoff = Backoff::Exponential { multiplier };
        self
    }

    #[must_use]
    pub fn maximum_redelivery_delay(mut self, cap: Duration) -> Self {
        self.maximum_redelivery_delay = cap;
        self
    }

    #[must_use]
    pub fn collision_avoidance(mut self, factor: f64) -> Self {
        self.collision_avoidance_factor = Some(factor);
        self
    }

    #[must_use]
    pub fn delay_pattern(mut self, pattern: DelayPattern) -> Self {
        self.delay_pattern = Some(pattern);
        self
    }

    /// Restricts redelivery to the given failure kind (may be repeated).
    #[must_use]
    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    /// Excludes a failure kind from redelivery.
    #[must_use]
    pub fn never_retry_on(mut self, kind: impl Into<String>) -> Self {
        self.never_retry_on.push(kind.into());
        self
    }

    #[must_use]
    pub fn retry_while<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Exchange, &ExchangeError) -> bool + Send + Sync + 'static,
    {
        self.retry_while = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn maximum_elapsed(mut self, limit: Duration) -> Self {
        self.maximum_elapsed = Some(limit);
        self
    }

    #[must_use]
    pub fn allow_redelivery_while_stopping(mut self, allow: bool) -> Self {
        self.allow_redelivery_while_stopping = allow;
        self
    }

    /// Checks option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPolicy`] naming the first bad option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Backoff::Exponential { multiplier } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::InvalidPolicy(format!(
                    "backoff multiplier must be at least 1, got {multiplier}"
                )));
            }
        }
        if let Some(factor) = self.collision_avoidance_factor {
            if !(0.0..=1.0).contains(&factor) {
                return Err(ConfigError::InvalidPolicy(format!(
                    "collision avoidance factor must be within 0..=1, got {factor}"
                )));
            }
        }
        if self.maximum_redelivery_delay < self.redelivery_delay {
            return Err(ConfigError::InvalidPolicy(
                "maximum redelivery delay is shorter than the initial delay".into(),
            ));
        }
        if let Some(kind) = self.retry_on.iter().find(|k| self.never_retry_on.contains(k)) {
            return Err(ConfigError::InvalidPolicy(format!(
                "failure kind '{kind}' is both retried and never retried"
            )));
        }
        Ok(())
    }

    /// Limit reported in the `RedeliveryMaxCounter` property.
    #[must_use]
    pub fn max_counter(&self) -> Option<i64> {
        (self.maximum_redeliveries >= 0).then(|| i64::from(self.maximum_redeliveries))
    }

    fn is_retryable_kind(&self, kind: &str) -> bool {
        if self.never_retry_on.iter().any(|k| k == kind) {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.iter().any(|k| k == kind)
    }

    /// Evaluates a failure. `state` holds the redeliveries performed so far
    /// and `elapsed` the time since the handler was entered.
    #[must_use]
    pub fn decide(
        &self,
        exchange: &Exchange,
        error: &ExchangeError,
        state: &RedeliveryState,
        elapsed: Duration,
    ) -> RedeliveryDecision {
        if error.is_fatal() {
            return RedeliveryDecision::Fatal;
        }
        if !self.is_retryable_kind(error.kind()) {
            return RedeliveryDecision::NotRetryable;
        }

        let next = state.counter + 1;
        if self.maximum_redeliveries >= 0 && i64::from(next) > i64::from(self.maximum_redeliveries) {
            return RedeliveryDecision::Exhausted;
        }
        if self.maximum_elapsed.is_some_and(|limit| elapsed >= limit) {
            return RedeliveryDecision::Exhausted;
        }
        if let Some(predicate) = &self.retry_while {
            if !predicate(exchange, error) {
                return RedeliveryDecision::Exhausted;
            }
        }

        RedeliveryDecision::Redeliver {
            delay: self.next_delay(state.previous_delay, next),
        }
    }

    /// Delay before redelivery number `redelivery` (1-based), given the
    /// delay used before the previous one.
    #[must_use]
    pub fn next_delay(&self, previous: Duration, redelivery: u32) -> Duration {
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(redelivery);
        }

        let mut delay = if previous.is_zero() {
            self.redelivery_delay
        } else {
            match self.backoff {
                Backoff::Exponential { multiplier } if multiplier > 1.0 => {
                    #[allow(
                        clippy::cast_precision_loss,
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss
                    )]
                    let millis = (multiplier * previous.as_millis() as f64).round() as u64;
                    Duration::from_millis(millis)
                }
                _ => previous,
            }
        };

        if let Some(factor) = self.collision_avoidance_factor {
            let mut rng = rand::rng();
            let variance = if rng.random_bool(0.5) { factor } else { -factor };
            let jitter = delay.as_secs_f64() * variance * rng.random::<f64>();
            delay = Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0));
        }

        delay.min(self.maximum_redelivery_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(counter: u32) -> RedeliveryState {
        RedeliveryState {
            counter,
            ..RedeliveryState::default()
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn maximum_attempts_is_redeliveries_plus_one() {
        let policy = RedeliveryPolicy::default().maximum_attempts(3);
        assert_eq!(policy.maximum_redeliveries, 2);
        assert_eq!(policy.max_counter(), Some(2));
        assert_eq!(RedeliveryPolicy::default().maximum_redeliveries(-1).max_counter(), None);
    }

    #[test]
    fn decide_respects_redelivery_budget() {
        let policy = RedeliveryPolicy::default().maximum_redeliveries(2);
        let ex = Exchange::in_only("x");
        let err = ExchangeError::generic("boom");

        assert!(matches!(
            policy.decide(&ex, &err, &state(0), Duration::ZERO),
            RedeliveryDecision::Redeliver { .. }
        ));
        assert!(matches!(
            policy.decide(&ex, &err, &state(1), Duration::ZERO),
            RedeliveryDecision::Redeliver { .. }
        ));
        assert_eq!(
            policy.decide(&ex, &err, &state(2), Duration::ZERO),
            RedeliveryDecision::Exhausted
        );
    }

    #[test]
    fn negative_maximum_is_unlimited() {
        let policy = RedeliveryPolicy::default().maximum_redeliveries(-1);
        let ex = Exchange::in_only("x");
        assert!(matches!(
            policy.decide(&ex, &ExchangeError::generic("x"), &state(10_000), Duration::ZERO),
            RedeliveryDecision::Redeliver { .. }
        ));
    }

    #[test]
    fn kind_lists_and_fatal_errors() {
        let policy = RedeliveryPolicy::default()
            .maximum_redeliveries(5)
            .never_retry_on("ValidationError");
        let ex = Exchange::in_only("x");
        assert_eq!(
            policy.decide(&ex, &ExchangeError::processing("ValidationError", "bad"), &state(0), Duration::ZERO),
            RedeliveryDecision::NotRetryable
        );
        assert_eq!(
            policy.decide(&ex, &ExchangeError::Configuration("no saga".into()), &state(0), Duration::ZERO),
            RedeliveryDecision::Fatal
        );

        let allow = RedeliveryPolicy::default().maximum_redeliveries(5).retry_on("IoError");
        assert_eq!(
            allow.decide(&ex, &ExchangeError::generic("other"), &state(0), Duration::ZERO),
            RedeliveryDecision::NotRetryable
        );
        assert!(matches!(
            allow.decide(&ex, &ExchangeError::processing("IoError", "reset"), &state(0), Duration::ZERO),
            RedeliveryDecision::Redeliver { .. }
        ));
    }

    #[test]
    fn retry_while_and_elapsed_limit() {
        let ex = Exchange::in_only("x");
        let err = ExchangeError::generic("x");

        let predicate = RedeliveryPolicy::default()
            .maximum_redeliveries(-1)
            .retry_while(|_, e| e.to_string().contains("transient"));
        assert_eq!(
            predicate.decide(&ex, &err, &state(0), Duration::ZERO),
            RedeliveryDecision::Exhausted
        );

        let elapsed = RedeliveryPolicy::default()
            .maximum_redeliveries(-1)
            .maximum_elapsed(ms(500));
        assert_eq!(
            elapsed.decide(&ex, &err, &state(0), ms(600)),
            RedeliveryDecision::Exhausted
        );
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(ms(100))
            .exponential_backoff(2.0)
            .maximum_redelivery_delay(ms(500));

        let first = policy.next_delay(Duration::ZERO, 1);
        let second = policy.next_delay(first, 2);
        let third = policy.next_delay(second, 3);
        let fourth = policy.next_delay(third, 4);
        assert_eq!([first, second, third, fourth], [ms(100), ms(200), ms(400), ms(500)]);
    }

    #[test]
    fn fixed_backoff_repeats_initial_delay() {
        let policy = RedeliveryPolicy::default().redelivery_delay(ms(250));
        let first = policy.next_delay(Duration::ZERO, 1);
        assert_eq!(policy.next_delay(first, 2), ms(250));
    }

    #[test]
    fn collision_avoidance_stays_within_factor() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(ms(1000))
            .collision_avoidance(0.15);
        for _ in 0..100 {
            let delay = policy.next_delay(Duration::ZERO, 1);
            assert!(delay >= ms(850) && delay <= ms(1150), "{delay:?}");
        }
    }

    #[test]
    fn delay_pattern_steps() {
        let pattern: DelayPattern = "3:1000;5:5000".parse().unwrap();
        assert_eq!(pattern.delay_for(1), Duration::ZERO);
        assert_eq!(pattern.delay_for(3), ms(1000));
        assert_eq!(pattern.delay_for(4), ms(1000));
        assert_eq!(pattern.delay_for(9), ms(5000));

        let policy = RedeliveryPolicy::default().delay_pattern(pattern);
        assert_eq!(policy.next_delay(ms(123), 5), ms(5000));
    }

    #[test]
    fn malformed_delay_patterns_are_rejected() {
        for bad in ["", "abc", "1:x", "5:100;3:200"] {
            assert!(
                matches!(bad.parse::<DelayPattern>(), Err(ConfigError::InvalidDelayPattern { .. })),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn validate_catches_bad_options() {
        assert!(RedeliveryPolicy::default().validate().is_ok());
        assert!(RedeliveryPolicy::default().exponential_backoff(0.5).validate().is_err());
        assert!(RedeliveryPolicy::default().collision_avoidance(1.5).validate().is_err());
        assert!(RedeliveryPolicy::default()
            .redelivery_delay(ms(10_000))
            .maximum_redelivery_delay(ms(1_000))
            .validate()
            .is_err());
        assert!(RedeliveryPolicy::default()
            .retry_on("A")
            .never_retry_on("A")
            .validate()
            .is_err());
    }
}
