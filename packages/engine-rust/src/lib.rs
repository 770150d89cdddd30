//! Conduit engine: asynchronous processor chains with redelivery, load
//! balancing, idempotent consumption, saga coordination and route lifecycle
//! management.

pub mod config;
pub mod context;
pub mod error;
pub mod error_handler;
pub mod expression;
pub mod idempotent;
pub mod load_balancer;
pub mod observability;
pub mod processor;
pub mod route;
pub mod saga;
pub mod service;

pub use config::{EngineConfig, SagaConfig, SupervisorConfig};
pub use context::EngineContext;
pub use error::ConfigError;
pub use error_handler::{DeadLetterChannel, RedeliveryErrorHandler, RedeliveryPolicy};
pub use expression::{Expression, SharedExpression};
pub use idempotent::{IdempotentConsumer, IdempotentRepository, RepositoryError};
pub use load_balancer::{LoadBalancer, Strategy};
pub use processor::{fn_processor, Pipeline, Processor, SharedProcessor};
pub use route::{Route, RouteController, RouteError, RouteStatus};
pub use saga::{SagaCoordinator, SagaError, SagaProcessor, SagaService, SagaState};
pub use service::{ManagedService, ServiceContext, ServiceRegistry};

pub use conduit_core::{properties, Exchange, ExchangeError, ExchangePattern, Message, Value};
