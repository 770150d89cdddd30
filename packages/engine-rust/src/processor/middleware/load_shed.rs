//! Load-shedding middleware for processing steps.
//!
//! Rejects exchanges when the wrapped step already has `max_concurrent`
//! exchanges in flight. Rejected exchanges complete immediately with
//! [`ExchangeError::Rejected`]; they are never queued.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::{Exchange, ExchangeError};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::processor::ExchangeFuture;

/// Rejection reason attached to shed exchanges.
pub const OVERLOADED: &str = "overloaded";

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent exchanges via a semaphore.
///
/// All services produced by one layer share the same permits.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Exchange> for LoadShedService<S>
where
    S: Service<Exchange, Response = Exchange, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = Infallible;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut exchange: Exchange) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            metrics::counter!("conduit_exchanges_rejected_total", "reason" => OVERLOADED)
                .increment(1);
            exchange.set_exception(ExchangeError::rejected(OVERLOADED));
            return Box::pin(async move { Ok(exchange) });
        };

        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
