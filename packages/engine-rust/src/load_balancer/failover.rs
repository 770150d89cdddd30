//! Failover dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};

use conduit_core::{properties, Exchange, ExchangeError};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::processor::SharedProcessor;

/// Options for the failover strategy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailoverPolicy {
    /// Failovers allowed after the first attempt. `None` tries every
    /// downstream once; larger values wrap around the list.
    pub maximum_failover_attempts: Option<usize>,
    /// Start each exchange at the next downstream instead of the first.
    pub round_robin: bool,
    /// Start each exchange at the last downstream that succeeded.
    pub sticky: bool,
    /// Failure kinds that trigger failover. Empty means every failure.
    pub exceptions: Vec<String>,
}

impl FailoverPolicy {
    #[must_use]
    pub fn round_robin(mut self) -> Self {
        self.round_robin = true;
        self
    }

    #[must_use]
    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    #[must_use]
    pub fn maximum_failover_attempts(mut self, attempts: usize) -> Self {
        self.maximum_failover_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn on_exception(mut self, kind: impl Into<String>) -> Self {
        self.exceptions.push(kind.into());
        self
    }

    fn should_fail_over(&self, error: &ExchangeError) -> bool {
        self.exceptions.is_empty() || self.exceptions.iter().any(|k| k == error.kind())
    }
}

fn record_attempts(exchange: &mut Exchange, attempts: usize) {
    let attempts = i64::try_from(attempts).unwrap_or(i64::MAX);
    exchange.set_property(properties::FAILOVER_ATTEMPTS, attempts);
}

/// Per-balancer failover state.
#[derive(Debug)]
pub(crate) struct Failover {
    policy: FailoverPolicy,
    counter: AtomicUsize,
    last_good: AtomicUsize,
}

impl Failover {
    pub(crate) fn new(policy: FailoverPolicy) -> Self {
        Self {
            policy,
            counter: AtomicUsize::new(0),
            last_good: AtomicUsize::new(0),
        }
    }

    fn start_index(&self, len: usize) -> usize {
        if self.policy.sticky {
            self.last_good.load(Ordering::Relaxed) % len
        } else if self.policy.round_robin {
            self.counter.fetch_add(1, Ordering::Relaxed) % len
        } else {
            0
        }
    }

    /// Tries downstreams in order until one succeeds or failover is denied.
    ///
    /// Every attempt starts from a snapshot of the exchange as it arrived,
    /// so partial mutations of a failed attempt never leak into the next.
    /// The returned exchange carries the number of attempts made.
    pub(crate) async fn dispatch(&self, exchange: Exchange, downstreams: &[SharedProcessor]) -> Exchange {
        let len = downstreams.len();
        let start = self.start_index(len);
        let max_failovers = self.policy.maximum_failover_attempts.unwrap_or(len - 1);
        let snapshot = exchange.clone();

        let mut current = exchange;
        let mut attempts = 0usize;
        loop {
            let index = (start + attempts) % len;
            current = downstreams[index].process(current).await;
            attempts += 1;

            let Some(error) = current.exception() else {
                if self.policy.sticky {
                    self.last_good.store(index, Ordering::Relaxed);
                }
                record_attempts(&mut current, attempts);
                return current;
            };

            if !self.policy.should_fail_over(error) {
                debug!(kind = error.kind(), "failure kind not eligible for failover");
                break;
            }
            if attempts > max_failovers {
                warn!(attempts, error = %error, "failover exhausted");
                break;
            }
            debug!(from = index, attempts, error = %error, "failing over");
            current = snapshot.clone();
        }

        record_attempts(&mut current, attempts);
        current
    }
}
