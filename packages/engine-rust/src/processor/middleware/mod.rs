//! Tower middleware layers that wrap processors.
//!
//! - [`timeout`]: races a step against a timer
//! - [`metrics`]: step timing and outcome via `tracing` spans and `metrics` counters
//! - [`load_shed`]: semaphore-based concurrency limiting
//! - [`stack`]: composes the layers around a processor

pub mod load_shed;
pub mod metrics;
pub mod stack;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use stack::{build_step_pipeline, StepOptions};
pub use timeout::TimeoutLayer;
