//! Name-based strategy construction.
//!
//! Maps strategy names to constructor functions. The built-in strategies are
//! pre-registered; applications add their own under new names.

use std::sync::Arc;

use dashmap::DashMap;

use super::{FailoverPolicy, SelectionStrategy, Strategy};
use crate::error::ConfigError;
use crate::expression::SharedExpression;

/// Options a strategy constructor may draw from.
#[derive(Clone, Default)]
pub struct StrategyOptions {
    /// Weights for `weighted`.
    pub weights: Vec<u32>,
    /// Round-robin order for `weighted` (otherwise random within the window).
    pub round_robin: bool,
    /// Correlation expression for `sticky`.
    pub correlation: Option<SharedExpression>,
    /// Options for `failover`.
    pub failover: FailoverPolicy,
}

/// Constructor registered under a strategy name.
pub type StrategyFactory = Arc<dyn Fn(&StrategyOptions) -> Result<Strategy, ConfigError> + Send + Sync>;

/// Explicit registry of strategy constructors.
pub struct StrategyRegistry {
    factories: DashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// Registry without any strategies.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry with the built-in strategies.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register("round-robin", |_| Ok(Strategy::RoundRobin));
        registry.register("random", |_| Ok(Strategy::Random));
        registry.register("sticky", |opts| {
            let correlation = opts
                .correlation
                .clone()
                .ok_or(ConfigError::MissingOption("correlation"))?;
            Ok(Strategy::Sticky { correlation })
        });
        registry.register("weighted", |opts| {
            if opts.weights.is_empty() {
                return Err(ConfigError::MissingOption("weights"));
            }
            Ok(Strategy::Weighted {
                weights: opts.weights.clone(),
                round_robin: opts.round_robin,
            })
        });
        registry.register("failover", |opts| Ok(Strategy::Failover(opts.failover.clone())));
        registry.register("topic", |_| Ok(Strategy::Topic));
        registry
    }

    /// Registers (or replaces) a constructor.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StrategyOptions) -> Result<Strategy, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Registers a custom selection strategy under its own name.
    pub fn register_custom(&self, strategy: Arc<dyn SelectionStrategy>) {
        let name = strategy.name().to_string();
        self.register(name, move |_| Ok(Strategy::Custom(Arc::clone(&strategy))));
    }

    /// Builds the strategy registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownStrategy`] for an unregistered name, or
    /// whatever the constructor reports.
    pub fn create(&self, name: &str, options: &StrategyOptions) -> Result<Strategy, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))?;
        factory(options)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
