//! Metrics middleware for processing steps.
//!
//! Wraps each step invocation in a `tracing` span and records duration and
//! outcome through the `metrics` facade. Without an installed recorder the
//! `metrics` macros are no-ops.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use conduit_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::processor::ExchangeFuture;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments a named step.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    step: Arc<str>,
}

impl MetricsLayer {
    pub fn new(step: impl Into<Arc<str>>) -> Self {
        Self { step: step.into() }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            step: Arc::clone(&self.step),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records step duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    step: Arc<str>,
}

impl<S> Service<Exchange> for MetricsService<S>
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
        let step = Arc::clone(&self.step);
        let span = info_span!(
            "exchange",
            exchange_id = exchange.id(),
            step = &*step,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(ex) if ex.is_failed() => "failed",
                    Ok(_) => "ok",
                    Err(never) => match *never {},
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "step complete");

                metrics::counter!(
                    "conduit_exchanges_total",
                    "step" => step.to_string(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!("conduit_exchange_duration_ms", "step" => step.to_string())
                    .record(elapsed.as_secs_f64() * 1000.0);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use conduit_core::{ExchangeError, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::processor::{fn_processor, ProcessorService};

    #[tokio::test]
    async fn passes_successful_exchange_through() {
        let inner = ProcessorService::new(fn_processor("set", |ex| {
            ex.message_mut().body = Value::from("seen");
        }));
        let svc = MetricsLayer::new("set").layer(inner);

        let ex = Exchange::in_only("x");
        let id = ex.id().to_string();
        let out = svc.oneshot(ex).await.unwrap();
        assert_eq!(out.id(), id);
        assert_eq!(out.message().body, Value::from("seen"));
    }

    #[tokio::test]
    async fn passes_failed_exchange_through() {
        let inner = ProcessorService::new(fn_processor("fail", |ex| {
            ex.set_exception(ExchangeError::generic("boom"));
        }));
        let svc = MetricsLayer::new("fail").layer(inner);

        let out = svc.oneshot(Exchange::in_only("x")).await.unwrap();
        assert_eq!(out.exception(), Some(&ExchangeError::generic("boom")));
    }
}
