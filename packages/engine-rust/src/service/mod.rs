//! Lifecycle-managed services and background workers.
//!
//! 1. **Registry** (`registry`): `ManagedService` trait and the explicit
//!    `ServiceRegistry` that initialises and shuts services down in order
//! 2. **Background workers** (`worker`): channel-fed tasks with periodic ticks

pub mod registry;
pub mod worker;

pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker};
