//! Step composition: wraps a processor with the optional middleware layers.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::processor::{ProcessorService, ServiceProcessor, SharedProcessor};

/// Per-step middleware options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepOptions {
    /// Deadline for the step, in milliseconds. `None` disables the timeout.
    pub timeout_ms: Option<u64>,
    /// Concurrency limit for the step. `None` disables load shedding.
    pub max_concurrent: Option<usize>,
    /// Record span and metrics for every invocation.
    pub instrument: bool,
}

impl StepOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let ms = timeout.as_millis() as u64;
        self.timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    #[must_use]
    pub fn instrumented(mut self) -> Self {
        self.instrument = true;
        self
    }
}

/// Wraps `processor` with the layers enabled in `options`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when saturated before doing any work
/// 2. `TimeoutLayer` -- enforce the step deadline
/// 3. `MetricsLayer` -- record timing and outcome closest to the step
///
/// Returns `processor` unchanged when no layer is enabled.
pub fn build_step_pipeline(processor: SharedProcessor, options: &StepOptions) -> SharedProcessor {
    if options.timeout_ms.is_none() && options.max_concurrent.is_none() && !options.instrument {
        return processor;
    }

    let name = processor.name().to_string();
    let service = ServiceBuilder::new()
        .option_layer(options.max_concurrent.map(LoadShedLayer::new))
        .option_layer(
            options
                .timeout_ms
                .map(|ms| TimeoutLayer::new(Duration::from_millis(ms))),
        )
        .option_layer(options.instrument.then(|| MetricsLayer::new(name.as_str())))
        .service(ProcessorService::new(processor));

    Arc::new(ServiceProcessor::new(name, service))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
