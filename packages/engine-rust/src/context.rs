//! The engine context: configuration, shared services and routes with one
//! lifecycle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::route::{Route, RouteBuilder, RouteController, RouteSupervisor};
use crate::service::{ServiceContext, ServiceRegistry};

/// Owns everything a running engine needs.
///
/// `start` initialises context-scoped services, then starts every route;
/// routes that fail to start are handed to the restart supervisor. `stop`
/// reverses the order.
pub struct EngineContext {
    config: Arc<EngineConfig>,
    services: ServiceRegistry,
    routes: Arc<RouteController>,
    supervisor: Mutex<Option<RouteSupervisor>>,
}

impl EngineContext {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            services: ServiceRegistry::new(),
            routes: Arc::new(RouteController::new()),
            supervisor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Services shared by every route of this engine.
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    #[must_use]
    pub fn routes(&self) -> &Arc<RouteController> {
        &self.routes
    }

    /// A route builder carrying this engine's configuration.
    #[must_use]
    pub fn route_builder(&self, id: impl Into<String>) -> RouteBuilder {
        Route::builder(id).config(Arc::clone(&self.config))
    }

    /// Routes the supervisor gave up on.
    pub async fn exhausted_routes(&self) -> Vec<String> {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .map(RouteSupervisor::exhausted)
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns the first service initialisation failure. Route start
    /// failures are not errors; those routes are retried in the background.
    pub async fn start(&self) -> anyhow::Result<()> {
        let ctx = ServiceContext {
            config: Arc::clone(&self.config),
        };
        self.services.init_all(&ctx).await?;

        let supervisor = RouteSupervisor::start(Arc::clone(&self.routes), self.config.supervisor.clone());
        for (route_id, error) in self.routes.start_all().await {
            warn!(route = %route_id, error = %error, "scheduling supervised restart");
            supervisor.schedule(route_id).await?;
        }
        if let Some(mut previous) = self.supervisor.lock().await.replace(supervisor) {
            previous.stop().await;
        }

        info!(engine = %self.config.name, routes = self.routes.len(), services = self.services.len(), "engine started");
        Ok(())
    }

    /// Stops the supervisor, every route and then the services.
    ///
    /// # Errors
    ///
    /// Returns the first route or service failure; everything is stopped
    /// regardless.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if let Some(mut supervisor) = self.supervisor.lock().await.take() {
            supervisor.stop().await;
        }
        let routes = self.routes.stop_all().await;
        let services = self.services.shutdown_all(false).await;
        info!(engine = %self.config.name, "engine stopped");
        routes?;
        services
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
