//! The asynchronous processor contract and its adapters.
//!
//! A [`Processor`] consumes an exchange and eventually hands it back,
//! mutated. A processor that never awaits completes synchronously on the
//! first poll; one that awaits I/O, a timer or another task suspends and
//! releases the worker thread until it is woken. Callers treat both the same.
//!
//! Processors interoperate with `tower`: [`ProcessorService`] exposes any
//! processor as a `tower::Service<Exchange>`, and [`ServiceProcessor`] turns
//! any cloneable service back into a processor, so `tower::Layer`s (see
//! [`middleware`]) wrap processors like any other service.

pub mod middleware;
pub mod pipeline;

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use conduit_core::Exchange;
use tower::{Service, ServiceExt};

pub use pipeline::Pipeline;

// ---------------------------------------------------------------------------
// Processor trait
// ---------------------------------------------------------------------------

/// A processing step.
///
/// Implementations must return the exchange exactly once. Failures are
/// recorded on the exchange via [`Exchange::set_exception`]; they never
/// escape as panics or errors.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process the exchange and hand it back.
    async fn process(&self, exchange: Exchange) -> Exchange;

    /// Short name used in logs and metrics.
    fn name(&self) -> &str {
        "processor"
    }
}

/// Shared, type-erased processor.
pub type SharedProcessor = Arc<dyn Processor>;

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, exchange: Exchange) -> Exchange {
        (**self).process(exchange).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ---------------------------------------------------------------------------
// FnProcessor
// ---------------------------------------------------------------------------

/// Plain transformation step backed by a synchronous closure.
///
/// Always completes synchronously.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) + Send + Sync,
{
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        (self.f)(&mut exchange);
        exchange
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").field("name", &self.name).finish()
    }
}

/// Creates a shared [`FnProcessor`].
pub fn fn_processor<F>(name: impl Into<String>, f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) + Send + Sync + 'static,
{
    Arc::new(FnProcessor::new(name, f))
}

// ---------------------------------------------------------------------------
// Tower bridge
// ---------------------------------------------------------------------------

/// Boxed future returned by exchange services.
pub type ExchangeFuture = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;

/// Exposes a processor as a `tower::Service<Exchange>`.
///
/// Always ready; the error type is `Infallible` because failures travel on
/// the exchange.
#[derive(Clone)]
pub struct ProcessorService {
    inner: SharedProcessor,
}

impl ProcessorService {
    #[must_use]
    pub fn new(inner: SharedProcessor) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for ProcessorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorService")
            .field("processor", &self.inner.name())
            .finish()
    }
}

impl Service<Exchange> for ProcessorService {
    type Response = Exchange;
    type Error = Infallible;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { Ok(inner.process(exchange).await) })
    }
}

/// Turns a cloneable `tower::Service<Exchange>` into a processor.
///
/// Each exchange is driven through its own clone of the service, the usual
/// tower pattern for sharing a service stack across concurrent callers.
#[derive(Clone)]
pub struct ServiceProcessor<S> {
    name: String,
    service: S,
}

impl<S> ServiceProcessor<S> {
    pub fn new(name: impl Into<String>, service: S) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }
}

#[async_trait]
impl<S> Processor for ServiceProcessor<S>
where
    S: Service<Exchange, Response = Exchange, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    async fn process(&self, exchange: Exchange) -> Exchange {
        match self.service.clone().oneshot(exchange).await {
            Ok(exchange) => exchange,
            Err(never) => match never {},
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
