//! Timeout middleware for processing steps.
//!
//! Races the wrapped step against a timer. When the timer wins, the exchange
//! is completed with [`ExchangeError::Timeout`] and the wrapped step's late
//! completion is discarded.

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;

use conduit_core::{Exchange, ExchangeError};
use tower::{Layer, Service};
use tracing::warn;

use crate::processor::ExchangeFuture;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps steps with a fixed completion deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the deadline.
///
/// Keeps a snapshot of the exchange as it entered the step; on expiry that
/// snapshot is returned with the timeout attached, since the in-flight
/// exchange is owned by the abandoned future.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Exchange> for TimeoutService<S>
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

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let snapshot = exchange.clone();
        let duration = self.timeout;
        let fut = self.inner.call(exchange);
        Box::pin(async move {
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = duration.as_millis() as u64;
                    warn!(exchange_id = snapshot.id(), timeout_ms, "step timed out");
                    let mut timed_out = snapshot;
                    timed_out.set_exception(ExchangeError::Timeout { timeout_ms });
                    Ok(timed_out)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
