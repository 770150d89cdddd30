//! Routes: named processor chains with a lifecycle.
//!
//! A [`Route`] admits exchanges only while started. Stopping flags the
//! route, waits for in-flight exchanges to drain and then shuts down the
//! route's own services. [`RouteController`] is the control plane over a set
//! of routes and [`RouteSupervisor`] retries routes that failed to start.

pub mod controller;
pub mod drain;
pub mod supervisor;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use conduit_core::{properties, Exchange, ExchangeError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

pub use controller::RouteController;
pub use drain::{DrainController, InFlightGuard, StopSignal};
pub use supervisor::{RestartTask, RouteSupervisor};

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::error_handler::{DeadLetterChannel, RedeliveryErrorHandler, RedeliveryPolicy};
use crate::processor::middleware::{build_step_pipeline, StepOptions};
use crate::processor::{Pipeline, Processor, SharedProcessor};
use crate::service::{ManagedService, ServiceContext, ServiceRegistry};

/// Rejection reason for exchanges offered to a route that is not started.
pub const NOT_STARTED: &str = "route-not-started";

// ---------------------------------------------------------------------------
// Status and errors
// ---------------------------------------------------------------------------

/// Route lifecycle status.
///
/// `Stopped -> Starting -> Started <-> Suspended`, and
/// `Started | Suspended -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Suspended,
    Stopping,
}

impl RouteStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operation during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Start,
    Stop,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The route kept going (stop failures: the route is stopped anyway).
    Warning,
    /// The route is not running because of the failure.
    Error,
}

/// Most recent lifecycle failure of a route.
#[derive(Debug, Clone)]
pub struct LastError {
    pub phase: LifecyclePhase,
    pub error: String,
    pub severity: ErrorSeverity,
    pub occurred_at: Instant,
}

/// Control-plane errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("no route registered with id '{0}'")]
    UnknownRoute(String),
    /// The operation is not allowed in the route's current status.
    #[error("cannot {operation} route '{route}' while {status}")]
    InvalidTransition {
        route: String,
        status: RouteStatus,
        operation: &'static str,
    },
    /// A service or lifecycle listener failed.
    #[error("route '{route}' failed to {phase}: {message}")]
    Lifecycle {
        route: String,
        phase: LifecyclePhase,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Lifecycle listeners and health
// ---------------------------------------------------------------------------

/// Callbacks around a route's start and stop.
#[async_trait]
pub trait RouteLifecycleListener: Send + Sync {
    /// Called after the route's services are initialised. An error aborts
    /// the start.
    async fn on_start(&self, _route_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after in-flight exchanges drained, before services shut down.
    async fn on_stop(&self, _route_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Point-in-time view of a route.
#[derive(Debug, Clone)]
pub struct RouteHealth {
    pub route_id: String,
    pub status: RouteStatus,
    pub in_flight: u64,
    /// Time since the last successful start; `None` unless started or
    /// suspended.
    pub uptime: Option<Duration>,
    pub last_error: Option<LastError>,
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// A named processor chain with a lifecycle.
pub struct Route {
    id: String,
    processor: SharedProcessor,
    status: ArcSwap<RouteStatus>,
    /// Serialises lifecycle operations.
    transition: tokio::sync::Mutex<()>,
    last_error: Mutex<Option<LastError>>,
    started_at: Mutex<Option<Instant>>,
    services: ServiceRegistry,
    listeners: Vec<Arc<dyn RouteLifecycleListener>>,
    drain: Arc<DrainController>,
    drain_timeout: Duration,
    context: ServiceContext,
}

impl Route {
    /// Starts assembling a route.
    pub fn builder(id: impl Into<String>) -> RouteBuilder {
        RouteBuilder::new(id)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        **self.status.load()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.lock().clone()
    }

    /// Services scoped to this route.
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.drain.in_flight_count()
    }

    #[must_use]
    pub fn health(&self) -> RouteHealth {
        let status = self.status();
        let uptime = match status {
            RouteStatus::Started | RouteStatus::Suspended => {
                let started_at = *self.started_at.lock();
                started_at.map(|at| at.elapsed())
            }
            _ => None,
        };
        RouteHealth {
            route_id: self.id.clone(),
            status,
            in_flight: self.in_flight(),
            uptime,
            last_error: self.last_error(),
        }
    }

    fn set_status(&self, status: RouteStatus) {
        let previous = self.status.swap(Arc::new(status));
        debug!(route = %self.id, from = %previous, to = %status, "route status changed");
    }

    fn record_error(&self, phase: LifecyclePhase, severity: ErrorSeverity, message: &str) -> RouteError {
        *self.last_error.lock() = Some(LastError {
            phase,
            error: message.to_string(),
            severity,
            occurred_at: Instant::now(),
        });
        RouteError::Lifecycle {
            route: self.id.clone(),
            phase,
            message: message.to_string(),
        }
    }

    fn invalid(&self, status: RouteStatus, operation: &'static str) -> RouteError {
        RouteError::InvalidTransition {
            route: self.id.clone(),
            status,
            operation,
        }
    }

    async fn run_start(&self) -> anyhow::Result<()> {
        self.services.init_all(&self.context).await?;
        for listener in &self.listeners {
            listener.on_start(&self.id).await?;
        }
        Ok(())
    }

    /// Starts a stopped route. Starting a started route is a no-op.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidTransition`] unless stopped or started, and
    /// [`RouteError::Lifecycle`] when a service or listener fails; the route
    /// is then stopped again and the failure recorded as its last error.
    pub async fn start(&self) -> Result<(), RouteError> {
        let _transition = self.transition.lock().await;
        match self.status() {
            RouteStatus::Started => return Ok(()),
            RouteStatus::Stopped => {}
            other => return Err(self.invalid(other, "start")),
        }

        self.set_status(RouteStatus::Starting);
        self.drain.reset();
        if let Err(e) = self.run_start().await {
            error!(route = %self.id, error = %e, "route failed to start");
            if let Err(cleanup) = self.services.shutdown_all(true).await {
                warn!(route = %self.id, error = %cleanup, "cleanup after failed start");
            }
            self.set_status(RouteStatus::Stopped);
            return Err(self.record_error(LifecyclePhase::Start, ErrorSeverity::Error, &format!("{e:#}")));
        }

        *self.started_at.lock() = Some(Instant::now());
        self.set_status(RouteStatus::Started);
        info!(route = %self.id, "route started");
        Ok(())
    }

    /// Stops the route: refuses new exchanges, waits for in-flight ones up
    /// to the drain timeout, then notifies listeners and shuts down the
    /// route's services. Stopping a stopped route is a no-op.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidTransition`] while starting or stopping, and
    /// [`RouteError::Lifecycle`] for the first listener or service failure.
    /// The route ends up stopped either way.
    pub async fn stop(&self) -> Result<(), RouteError> {
        let _transition = self.transition.lock().await;
        match self.status() {
            RouteStatus::Stopped => return Ok(()),
            RouteStatus::Started | RouteStatus::Suspended => {}
            other => return Err(self.invalid(other, "stop")),
        }

        self.set_status(RouteStatus::Stopping);
        self.drain.signal_stop();
        if !self.drain.wait_for_drain(self.drain_timeout).await {
            warn!(
                route = %self.id,
                in_flight = self.drain.in_flight_count(),
                "drain timeout elapsed, stopping with exchanges in flight"
            );
        }

        let mut failure: Option<anyhow::Error> = None;
        for listener in &self.listeners {
            if let Err(e) = listener.on_stop(&self.id).await {
                warn!(route = %self.id, error = %e, "lifecycle listener failed on stop");
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = self.services.shutdown_all(false).await {
            failure.get_or_insert(e);
        }

        *self.started_at.lock() = None;
        self.set_status(RouteStatus::Stopped);
        info!(route = %self.id, "route stopped");
        match failure {
            Some(e) => Err(self.record_error(LifecyclePhase::Stop, ErrorSeverity::Warning, &format!("{e:#}"))),
            None => Ok(()),
        }
    }

    /// Pauses admission without stopping services.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidTransition`] unless started or suspended.
    pub async fn suspend(&self) -> Result<(), RouteError> {
        let _transition = self.transition.lock().await;
        match self.status() {
            RouteStatus::Suspended => Ok(()),
            RouteStatus::Started => {
                self.set_status(RouteStatus::Suspended);
                info!(route = %self.id, "route suspended");
                Ok(())
            }
            other => Err(self.invalid(other, "suspend")),
        }
    }

    /// # Errors
    ///
    /// [`RouteError::InvalidTransition`] unless suspended or started.
    pub async fn resume(&self) -> Result<(), RouteError> {
        let _transition = self.transition.lock().await;
        match self.status() {
            RouteStatus::Started => Ok(()),
            RouteStatus::Suspended => {
                self.set_status(RouteStatus::Started);
                info!(route = %self.id, "route resumed");
                Ok(())
            }
            other => Err(self.invalid(other, "resume")),
        }
    }

    /// Stops the route, waits `delay`, then starts it. The start is
    /// attempted even if the stop failed.
    ///
    /// # Errors
    ///
    /// The start failure if there is one, otherwise the stop failure.
    pub async fn restart(&self, delay: Duration) -> Result<(), RouteError> {
        let stopped = self.stop().await;
        if let Err(e) = &stopped {
            warn!(route = %self.id, error = %e, "stop failed during restart, starting anyway");
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.start().await?;
        stopped
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("processor", &self.processor.name())
            .field("services", &self.services.names())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Processor for Route {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let _guard = self.drain.in_flight_guard();
        let status = self.status();
        if status != RouteStatus::Started {
            metrics::counter!("conduit_exchanges_rejected_total", "reason" => NOT_STARTED).increment(1);
            debug!(route = %self.id, exchange_id = exchange.id(), status = %status, "exchange rejected");
            exchange.set_exception(ExchangeError::rejected(format!("route '{}' is {status}", self.id)));
            return exchange;
        }
        exchange.set_property(properties::ROUTE_ID, self.id.clone());
        self.processor.process(exchange).await
    }

    fn name(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// RouteBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Route`].
///
/// Steps run as a [`Pipeline`]. An optional redelivery error handler wraps
/// the pipeline and is tied to the route's stop signal; admission control
/// (from [`EngineConfig::max_concurrent_exchanges`] or
/// [`max_concurrent`](Self::max_concurrent)) wraps everything.
pub struct RouteBuilder {
    id: String,
    steps: Vec<SharedProcessor>,
    services: ServiceRegistry,
    listeners: Vec<Arc<dyn RouteLifecycleListener>>,
    error_handler: Option<(RedeliveryPolicy, Option<DeadLetterChannel>)>,
    options: StepOptions,
    config: Arc<EngineConfig>,
}

impl RouteBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            services: ServiceRegistry::new(),
            listeners: Vec::new(),
            error_handler: None,
            options: StepOptions::default(),
            config: Arc::new(EngineConfig::default()),
        }
    }

    /// Uses the engine configuration for drain timeout and admission limits.
    #[must_use]
    pub fn config(mut self, config: Arc<EngineConfig>) -> Self {
        self.options.max_concurrent = self.options.max_concurrent.or(config.max_concurrent_exchanges);
        self.config = config;
        self
    }

    #[must_use]
    pub fn step(mut self, step: SharedProcessor) -> Self {
        self.steps.push(step);
        self
    }

    /// Registers a service initialised on start and shut down on stop.
    #[must_use]
    pub fn service<T: ManagedService>(self, service: Arc<T>) -> Self {
        self.services.register_arc(service);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn RouteLifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Wraps the steps in a redelivery error handler.
    #[must_use]
    pub fn error_handler(mut self, policy: RedeliveryPolicy, dead_letter: Option<DeadLetterChannel>) -> Self {
        self.error_handler = Some((policy, dead_letter));
        self
    }

    /// Limits concurrently admitted exchanges.
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.options.max_concurrent = Some(max);
        self
    }

    /// Records a span and metrics for every exchange the route admits.
    #[must_use]
    pub fn instrumented(mut self) -> Self {
        self.options.instrument = true;
        self
    }

    /// # Errors
    ///
    /// Returns the error handler's policy validation error.
    pub fn build(self) -> Result<Route, ConfigError> {
        let drain = Arc::new(DrainController::new());
        let mut processor: SharedProcessor = Arc::new(Pipeline::new(self.id.clone(), self.steps));

        if let Some((policy, dead_letter)) = self.error_handler {
            let mut handler = RedeliveryErrorHandler::new(processor, policy)?
                .named(format!("{}-error-handler", self.id))
                .with_stop_signal(drain.stop_signal());
            if let Some(channel) = dead_letter {
                handler = handler.dead_letter(channel);
            }
            processor = Arc::new(handler);
        }
        let processor = build_step_pipeline(processor, &self.options);

        Ok(Route {
            id: self.id,
            processor,
            status: ArcSwap::from_pointee(RouteStatus::Stopped),
            transition: tokio::sync::Mutex::new(()),
            last_error: Mutex::new(None),
            started_at: Mutex::new(None),
            services: self.services,
            listeners: self.listeners,
            drain,
            drain_timeout: self.config.drain_timeout(),
            context: ServiceContext {
                config: self.config,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conduit_core::Value;

    use super::*;
    use crate::processor::fn_processor;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<&'static str>>,
        fail_stop: bool,
        fail_start: bool,
    }

    #[async_trait]
    impl RouteLifecycleListener for RecordingListener {
        async fn on_start(&self, _route_id: &str) -> anyhow::Result<()> {
            self.events.lock().push("start");
            if self.fail_start {
                anyhow::bail!("listener refused start");
            }
            Ok(())
        }

        async fn on_stop(&self, _route_id: &str) -> anyhow::Result<()> {
            self.events.lock().push("stop");
            if self.fail_stop {
                anyhow::bail!("listener refused stop");
            }
            Ok(())
        }
    }

    struct CountingService {
        inits: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl ManagedService for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Processor for Sleepy {
        async fn process(&self, exchange: Exchange) -> Exchange {
            tokio::time::sleep(Duration::from_millis(200)).await;
            exchange
        }
    }

    fn echo() -> SharedProcessor {
        fn_processor("echo", |ex| {
            ex.set_output(conduit_core::Message::new("done"));
        })
    }

    #[tokio::test]
    async fn restart_calls_stop_then_start_once() {
        let listener = Arc::new(RecordingListener::default());
        let route = Route::builder("orders").step(echo()).listener(listener.clone()).build().unwrap();
        route.start().await.unwrap();
        listener.events.lock().clear();

        route.restart(Duration::ZERO).await.unwrap();

        assert_eq!(*listener.events.lock(), vec!["stop", "start"]);
        assert_eq!(route.status(), RouteStatus::Started);
    }

    #[tokio::test]
    async fn restart_starts_even_if_stop_fails() {
        let listener = Arc::new(RecordingListener {
            fail_stop: true,
            ..RecordingListener::default()
        });
        let route = Route::builder("orders").step(echo()).listener(listener).build().unwrap();
        route.start().await.unwrap();

        let err = route.restart(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, RouteError::Lifecycle { phase: LifecyclePhase::Stop, .. }));
        assert_eq!(route.status(), RouteStatus::Started);
        let last = route.last_error().unwrap();
        assert_eq!(last.phase, LifecyclePhase::Stop);
        assert_eq!(last.severity, ErrorSeverity::Warning);
    }

    #[tokio::test]
    async fn failed_start_leaves_route_stopped_with_last_error() {
        let listener = Arc::new(RecordingListener {
            fail_start: true,
            ..RecordingListener::default()
        });
        let route = Route::builder("orders").step(echo()).listener(listener).build().unwrap();

        let err = route.start().await.unwrap_err();
        assert!(err.to_string().contains("listener refused start"));
        assert_eq!(route.status(), RouteStatus::Stopped);
        assert_eq!(route.last_error().unwrap().phase, LifecyclePhase::Start);
    }

    #[tokio::test]
    async fn only_started_routes_admit_exchanges() {
        let route = Route::builder("orders").step(echo()).build().unwrap();

        let out = route.process(Exchange::in_only("x")).await;
        assert!(matches!(out.exception(), Some(ExchangeError::Rejected { .. })));

        route.start().await.unwrap();
        let out = route.process(Exchange::in_only("x")).await;
        assert!(!out.is_failed());
        assert_eq!(out.message().body, Value::from("done"));
        assert_eq!(out.property_str(properties::ROUTE_ID), Some("orders"));

        route.suspend().await.unwrap();
        assert!(route.process(Exchange::in_only("x")).await.is_failed());
        route.resume().await.unwrap();
        assert!(!route.process(Exchange::in_only("x")).await.is_failed());
    }

    #[tokio::test]
    async fn services_follow_route_lifecycle() {
        let service = Arc::new(CountingService {
            inits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        let route = Route::builder("orders").step(echo()).service(service.clone()).build().unwrap();

        route.start().await.unwrap();
        route.start().await.unwrap();
        route.stop().await.unwrap();
        assert_eq!(service.inits.load(Ordering::SeqCst), 1);
        assert_eq!(service.shutdowns.load(Ordering::SeqCst), 1);
        assert!(route.services().get::<CountingService>().is_some());
    }

    #[tokio::test]
    async fn invalid_transitions_are_reported() {
        let route = Route::builder("orders").step(echo()).build().unwrap();
        let err = route.suspend().await.unwrap_err();
        assert_eq!(
            err,
            RouteError::InvalidTransition {
                route: "orders".into(),
                status: RouteStatus::Stopped,
                operation: "suspend",
            }
        );
        assert!(route.resume().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_exchanges() {
        let route = Arc::new(Route::builder("orders").step(Arc::new(Sleepy)).build().unwrap());
        route.start().await.unwrap();

        let worker = Arc::clone(&route);
        let in_flight = tokio::spawn(async move { worker.process(Exchange::in_only("x")).await });
        tokio::task::yield_now().await;
        assert_eq!(route.in_flight(), 1);

        route.stop().await.unwrap();
        assert_eq!(route.in_flight(), 0);
        assert!(!in_flight.await.unwrap().is_failed());
        assert!(route.health().uptime.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_route_cuts_redelivery_short() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failing = fn_processor("failing", move |ex| {
            counter.fetch_add(1, Ordering::SeqCst);
            ex.set_exception(ExchangeError::generic("down"));
        });
        let route = Arc::new(
            Route::builder("orders")
                .step(failing)
                .error_handler(
                    RedeliveryPolicy::default()
                        .maximum_redeliveries(100)
                        .redelivery_delay(Duration::from_secs(1)),
                    None,
                )
                .build()
                .unwrap(),
        );
        route.start().await.unwrap();

        let worker = Arc::clone(&route);
        let in_flight = tokio::spawn(async move { worker.process(Exchange::in_only("x")).await });
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        route.stop().await.unwrap();
        let out = in_flight.await.unwrap();
        assert!(matches!(out.exception(), Some(ExchangeError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn health_reports_status_and_uptime() {
        let route = Route::builder("orders").step(echo()).build().unwrap();
        assert!(route.health().uptime.is_none());
        route.start().await.unwrap();
        let health = route.health();
        assert_eq!(health.status, RouteStatus::Started);
        assert_eq!(health.in_flight, 0);
        assert!(health.uptime.is_some());
        assert!(health.last_error.is_none());
    }

    #[test]
    fn admission_limit_comes_from_config() {
        let config = Arc::new(EngineConfig {
            max_concurrent_exchanges: Some(4),
            ..EngineConfig::default()
        });
        let builder = Route::builder("orders").config(config);
        assert_eq!(builder.options.max_concurrent, Some(4));
    }
}
