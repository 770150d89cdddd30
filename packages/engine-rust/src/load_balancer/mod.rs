//! Load-balanced dispatch to downstream processors.
//!
//! Strategies form a closed set ([`Strategy`]) dispatched through a single
//! `match`; externally supplied strategies plug in through
//! [`SelectionStrategy`] and the name-based [`StrategyRegistry`].

pub mod failover;
pub mod registry;
pub mod weighted;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::hash::bucket_for;
use conduit_core::{Exchange, ExchangeError};
use futures_util::future::join_all;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::expression::SharedExpression;
use crate::processor::{Processor, SharedProcessor};

use failover::Failover;
pub use failover::FailoverPolicy;
pub use registry::{StrategyOptions, StrategyRegistry};
pub use weighted::WeightedSelector;

/// Externally supplied selection function.
///
/// Returns the index of the downstream to use; an index outside
/// `0..downstreams` fails the exchange with a configuration error.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, exchange: &Exchange, downstreams: usize) -> usize;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Distribution strategy of a [`LoadBalancer`].
#[derive(Clone)]
pub enum Strategy {
    /// Next downstream per call, wrapping.
    RoundRobin,
    /// Uniformly random downstream per call.
    Random,
    /// Consistent hashing of a correlation key; calls without a key fall
    /// back to round-robin.
    Sticky { correlation: SharedExpression },
    /// Selection frequency proportional to `weights`.
    Weighted { weights: Vec<u32>, round_robin: bool },
    /// Try downstreams in order until one succeeds.
    Failover(FailoverPolicy),
    /// Send an independent copy to every downstream and wait for all.
    Topic,
    /// Externally supplied selection.
    Custom(Arc<dyn SelectionStrategy>),
}

impl Strategy {
    /// Registry name of the strategy.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::Sticky { .. } => "sticky",
            Self::Weighted { .. } => "weighted",
            Self::Failover(_) => "failover",
            Self::Topic => "topic",
            Self::Custom(custom) => custom.name(),
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weighted { weights, round_robin } => f
                .debug_struct("Weighted")
                .field("weights", weights)
                .field("round_robin", round_robin)
                .finish(),
            Self::Failover(policy) => f.debug_tuple("Failover").field(policy).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Runtime state derived from a [`Strategy`].
enum Selector {
    RoundRobin(AtomicUsize),
    Random,
    Sticky {
        correlation: SharedExpression,
        fallback: AtomicUsize,
    },
    Weighted(WeightedSelector),
    Failover(Failover),
    Topic,
    Custom(Arc<dyn SelectionStrategy>),
}

/// Dispatches each exchange to one (or, for topic, every) downstream.
///
/// The downstream list is fixed at construction.
pub struct LoadBalancer {
    name: String,
    kind: String,
    downstreams: Vec<SharedProcessor>,
    selector: Selector,
}

impl LoadBalancer {
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyDownstreams`] for an empty downstream
    /// list and the weighted selector's errors for invalid weights.
    pub fn new(
        name: impl Into<String>,
        strategy: Strategy,
        downstreams: Vec<SharedProcessor>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if downstreams.is_empty() {
            return Err(ConfigError::EmptyDownstreams(name));
        }
        let kind = strategy.kind().to_string();
        let selector = match strategy {
            Strategy::RoundRobin => Selector::RoundRobin(AtomicUsize::new(0)),
            Strategy::Random => Selector::Random,
            Strategy::Sticky { correlation } => Selector::Sticky {
                correlation,
                fallback: AtomicUsize::new(0),
            },
            Strategy::Weighted { weights, round_robin } => {
                Selector::Weighted(WeightedSelector::new(weights, downstreams.len(), round_robin)?)
            }
            Strategy::Failover(policy) => Selector::Failover(Failover::new(policy)),
            Strategy::Topic => Selector::Topic,
            Strategy::Custom(custom) => Selector::Custom(custom),
        };
        Ok(Self {
            name,
            kind,
            downstreams,
            selector,
        })
    }

    #[must_use]
    pub fn downstreams(&self) -> &[SharedProcessor] {
        &self.downstreams
    }

    /// Registry name of the configured strategy.
    #[must_use]
    pub fn strategy_kind(&self) -> &str {
        &self.kind
    }

    fn round_robin(counter: &AtomicUsize, len: usize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed) % len
    }

    async fn dispatch_to(&self, index: usize, exchange: Exchange) -> Exchange {
        trace!(balancer = %self.name, index, exchange_id = exchange.id(), "dispatching");
        self.downstreams[index].process(exchange).await
    }

    /// Sends a copy to every downstream; resolves once all copies complete.
    ///
    /// The original is returned, carrying the first failure in downstream
    /// order if any copy failed.
    async fn broadcast(&self, mut exchange: Exchange) -> Exchange {
        let branches = self
            .downstreams
            .iter()
            .map(|downstream| downstream.process(exchange.copy()));
        let results = join_all(branches).await;

        if let Some(error) = results.iter().find_map(|r| r.exception().cloned()) {
            debug!(balancer = %self.name, error = %error, "broadcast branch failed");
            exchange.set_exception(error);
        }
        exchange
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("strategy", &self.kind)
            .field("downstreams", &self.downstreams.len())
            .finish()
    }
}

#[async_trait]
impl Processor for LoadBalancer {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let len = self.downstreams.len();
        let index = match &self.selector {
            Selector::RoundRobin(counter) => Self::round_robin(counter, len),
            Selector::Random => rand::rng().random_range(0..len),
            Selector::Sticky {
                correlation,
                fallback,
            } => match correlation.evaluate(&exchange) {
                Some(key) => {
                    let buckets = u32::try_from(len).unwrap_or(u32::MAX);
                    bucket_for(&key, buckets) as usize
                }
                None => Self::round_robin(fallback, len),
            },
            Selector::Weighted(selector) => selector.select(),
            Selector::Failover(failover) => {
                return failover.dispatch(exchange, &self.downstreams).await;
            }
            Selector::Topic => return self.broadcast(exchange).await,
            Selector::Custom(custom) => {
                let index = custom.select(&exchange, len);
                if index >= len {
                    exchange.set_exception(ExchangeError::Configuration(format!(
                        "strategy '{}' selected downstream {index} of {len}",
                        custom.name()
                    )));
                    return exchange;
                }
                index
            }
        };
        self.dispatch_to(index, exchange).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::{properties, Value};
    use parking_lot::Mutex;

    use super::*;
    use crate::expression::header;
    use crate::processor::fn_processor;

    fn recorder(tag: usize, log: Arc<Mutex<Vec<usize>>>) -> SharedProcessor {
        fn_processor(format!("d{tag}"), move |_| log.lock().push(tag))
    }

    fn recorders(n: usize) -> (Vec<SharedProcessor>, Arc<Mutex<Vec<usize>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = (0..n).map(|i| recorder(i, log.clone())).collect();
        (downstreams, log)
    }

    fn failing(kind: &'static str, log: Arc<Mutex<Vec<usize>>>, tag: usize) -> SharedProcessor {
        fn_processor(format!("fail{tag}"), move |ex| {
            log.lock().push(tag);
            ex.message_mut().set_header("touched", true);
            ex.set_exception(ExchangeError::processing(kind, "down"));
        })
    }

    /// Sleeps, then appends its tag to a shared log.
    struct Delayed {
        tag: usize,
        delay_ms: u64,
        log: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Processor for Delayed {
        async fn process(&self, exchange: Exchange) -> Exchange {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.log.lock().push(self.tag);
            exchange
        }
    }

    #[test]
    fn empty_downstreams_rejected_synchronously() {
        let err = LoadBalancer::new("lb", Strategy::RoundRobin, Vec::new()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyDownstreams("lb".into()));
    }

    #[tokio::test]
    async fn round_robin_is_fair_and_cyclic() {
        let (downstreams, log) = recorders(3);
        let lb = LoadBalancer::new("lb", Strategy::RoundRobin, downstreams).unwrap();
        for _ in 0..9 {
            lb.process(Exchange::in_only("x")).await;
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn round_robin_counter_is_shared_across_tasks() {
        let (downstreams, log) = recorders(3);
        let lb = Arc::new(LoadBalancer::new("lb", Strategy::RoundRobin, downstreams).unwrap());
        let mut handles = Vec::new();
        for _ in 0..30 {
            let lb = Arc::clone(&lb);
            handles.push(tokio::spawn(async move { lb.process(Exchange::in_only("x")).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let log = log.lock();
        for tag in 0..3 {
            assert_eq!(log.iter().filter(|t| **t == tag).count(), 10);
        }
    }

    #[tokio::test]
    async fn random_stays_in_range() {
        let (downstreams, log) = recorders(4);
        let lb = LoadBalancer::new("lb", Strategy::Random, downstreams).unwrap();
        for _ in 0..50 {
            lb.process(Exchange::in_only("x")).await;
        }
        assert_eq!(log.lock().len(), 50);
        assert!(log.lock().iter().all(|t| *t < 4));
    }

    #[tokio::test]
    async fn sticky_maps_same_key_to_same_downstream() {
        let (downstreams, log) = recorders(5);
        let lb = LoadBalancer::new(
            "lb",
            Strategy::Sticky {
                correlation: header("customer"),
            },
            downstreams,
        )
        .unwrap();

        for customer in ["alice", "bob", "alice", "carol", "alice", "bob"] {
            let mut ex = Exchange::in_only("x");
            ex.input_mut().set_header("customer", customer);
            lb.process(ex).await;
        }
        let log = log.lock();
        assert_eq!(log[0], log[2]);
        assert_eq!(log[0], log[4]);
        assert_eq!(log[1], log[5]);
    }

    #[tokio::test]
    async fn sticky_without_key_falls_back_to_round_robin() {
        let (downstreams, log) = recorders(2);
        let lb = LoadBalancer::new(
            "lb",
            Strategy::Sticky {
                correlation: header("customer"),
            },
            downstreams,
        )
        .unwrap();
        for _ in 0..4 {
            lb.process(Exchange::in_only("x")).await;
        }
        assert_eq!(*log.lock(), vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn weighted_round_robin_distribution() {
        let (downstreams, log) = recorders(3);
        let lb = LoadBalancer::new(
            "lb",
            Strategy::Weighted {
                weights: vec![4, 2, 1],
                round_robin: true,
            },
            downstreams,
        )
        .unwrap();
        for _ in 0..7 {
            lb.process(Exchange::in_only("x")).await;
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 0, 1, 0, 0]);
    }

    #[test]
    fn weighted_with_wrong_weight_count_is_config_error() {
        let (downstreams, _) = recorders(3);
        let err = LoadBalancer::new(
            "lb",
            Strategy::Weighted {
                weights: vec![1],
                round_robin: true,
            },
            downstreams,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::WeightMismatch { expected: 3, actual: 1 });
    }

    #[tokio::test]
    async fn failover_tries_next_until_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = vec![
            failing("IoError", log.clone(), 0),
            failing("IoError", log.clone(), 1),
            recorder(2, log.clone()),
        ];
        let lb = LoadBalancer::new("lb", Strategy::Failover(FailoverPolicy::default()), downstreams).unwrap();

        let out = lb.process(Exchange::in_only("x")).await;
        assert!(!out.is_failed());
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(out.property(properties::FAILOVER_ATTEMPTS), Some(&Value::Int(3)));
        // Each attempt starts from the original exchange.
        assert!(out.message().header("touched").is_none());
    }

    #[tokio::test]
    async fn failover_fails_after_every_downstream_failed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = vec![
            failing("IoError", log.clone(), 0),
            failing("Timeout", log.clone(), 1),
        ];
        let lb = LoadBalancer::new("lb", Strategy::Failover(FailoverPolicy::default()), downstreams).unwrap();

        let out = lb.process(Exchange::in_only("x")).await;
        assert_eq!(out.exception().map(ExchangeError::kind), Some("Timeout"));
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn failover_only_on_listed_kinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = vec![failing("ValidationError", log.clone(), 0), recorder(1, log.clone())];
        let policy = FailoverPolicy::default().on_exception("IoError");
        let lb = LoadBalancer::new("lb", Strategy::Failover(policy), downstreams).unwrap();

        let out = lb.process(Exchange::in_only("x")).await;
        assert!(out.is_failed());
        assert_eq!(*log.lock(), vec![0]);
    }

    #[tokio::test]
    async fn failover_round_robin_rotates_start() {
        let (downstreams, log) = recorders(3);
        let policy = FailoverPolicy::default().round_robin();
        let lb = LoadBalancer::new("lb", Strategy::Failover(policy), downstreams).unwrap();
        for _ in 0..3 {
            lb.process(Exchange::in_only("x")).await;
        }
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failover_sticky_remembers_last_good() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = vec![failing("IoError", log.clone(), 0), recorder(1, log.clone())];
        let policy = FailoverPolicy::default().sticky();
        let lb = LoadBalancer::new("lb", Strategy::Failover(policy), downstreams).unwrap();

        lb.process(Exchange::in_only("x")).await;
        lb.process(Exchange::in_only("x")).await;
        assert_eq!(*log.lock(), vec![0, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn topic_waits_for_every_branch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams: Vec<SharedProcessor> = [40, 10, 30, 20]
            .into_iter()
            .enumerate()
            .map(|(tag, delay_ms)| {
                Arc::new(Delayed {
                    tag,
                    delay_ms,
                    log: log.clone(),
                }) as SharedProcessor
            })
            .collect();
        let lb = LoadBalancer::new("lb", Strategy::Topic, downstreams).unwrap();

        let ex = Exchange::in_only("x");
        let id = ex.id().to_string();
        let out = lb.process(ex).await;

        assert_eq!(out.id(), id);
        assert!(!out.is_failed());
        assert_eq!(*log.lock(), vec![1, 3, 2, 0]);
    }

    #[tokio::test]
    async fn topic_branches_get_independent_copies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let make = |tag: &'static str| {
            let seen = seen.clone();
            fn_processor(tag, move |ex| {
                ex.message_mut().set_header("branch", tag);
                seen.lock().push(ex.id().to_string());
            })
        };
        let lb = LoadBalancer::new("lb", Strategy::Topic, vec![make("a"), make("b")]).unwrap();

        let ex = Exchange::in_only("x");
        let id = ex.id().to_string();
        let out = lb.process(ex).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
        assert!(!seen.contains(&id));
        assert!(out.message().header("branch").is_none());
    }

    #[tokio::test]
    async fn topic_surfaces_first_branch_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let downstreams = vec![
            recorder(0, log.clone()),
            failing("First", log.clone(), 1),
            failing("Second", log.clone(), 2),
        ];
        let lb = LoadBalancer::new("lb", Strategy::Topic, downstreams).unwrap();

        let out = lb.process(Exchange::in_only("x")).await;
        assert_eq!(out.exception().map(ExchangeError::kind), Some("First"));
        assert_eq!(log.lock().len(), 3);
    }

    struct Always(usize);

    impl SelectionStrategy for Always {
        fn select(&self, _exchange: &Exchange, _downstreams: usize) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn custom_strategy_selects_and_validates_index() {
        let (downstreams, log) = recorders(2);
        let lb = LoadBalancer::new("lb", Strategy::Custom(Arc::new(Always(1))), downstreams).unwrap();
        lb.process(Exchange::in_only("x")).await;
        assert_eq!(*log.lock(), vec![1]);

        let (downstreams, _) = recorders(2);
        let lb = LoadBalancer::new("lb", Strategy::Custom(Arc::new(Always(7))), downstreams).unwrap();
        let out = lb.process(Exchange::in_only("x")).await;
        assert!(matches!(out.exception(), Some(ExchangeError::Configuration(_))));
    }
}
