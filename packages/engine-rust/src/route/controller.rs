//! Control plane over a set of named routes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{LastError, Route, RouteError, RouteHealth, RouteStatus};

/// Named route registry exposing the lifecycle operations.
///
/// Routes start in registration order and stop in reverse registration
/// order.
pub struct RouteController {
    routes: DashMap<String, Arc<Route>>,
    order: RwLock<Vec<String>>,
}

impl RouteController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a route. A route with the same id is replaced in place.
    pub fn add(&self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);
        let id = route.id().to_string();
        if self.routes.insert(id.clone(), Arc::clone(&route)).is_none() {
            self.order.write().push(id);
        }
        route
    }

    /// Removes a route; it is not stopped.
    pub fn remove(&self, id: &str) -> Option<Arc<Route>> {
        let removed = self.routes.remove(id).map(|(_, route)| route);
        if removed.is_some() {
            self.order.write().retain(|existing| existing != id);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Route ids in registration order.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn route(&self, id: &str) -> Result<Arc<Route>, RouteError> {
        self.get(id).ok_or_else(|| RouteError::UnknownRoute(id.to_string()))
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] or the route's start failure.
    pub async fn start(&self, id: &str) -> Result<(), RouteError> {
        self.route(id)?.start().await
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] or the route's stop failure.
    pub async fn stop(&self, id: &str) -> Result<(), RouteError> {
        self.route(id)?.stop().await
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] or an invalid transition.
    pub async fn suspend(&self, id: &str) -> Result<(), RouteError> {
        self.route(id)?.suspend().await
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] or an invalid transition.
    pub async fn resume(&self, id: &str) -> Result<(), RouteError> {
        self.route(id)?.resume().await
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] or the restart failure.
    pub async fn restart(&self, id: &str, delay: Duration) -> Result<(), RouteError> {
        self.route(id)?.restart(delay).await
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`].
    pub fn status(&self, id: &str) -> Result<RouteStatus, RouteError> {
        Ok(self.route(id)?.status())
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`].
    pub fn last_error(&self, id: &str) -> Result<Option<LastError>, RouteError> {
        Ok(self.route(id)?.last_error())
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`].
    pub fn health(&self, id: &str) -> Result<RouteHealth, RouteError> {
        Ok(self.route(id)?.health())
    }

    /// Health of every route, in registration order.
    #[must_use]
    pub fn health_all(&self) -> Vec<RouteHealth> {
        self.route_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .map(|route| route.health())
            .collect()
    }

    /// Starts every route in registration order. A failing route does not
    /// prevent the others from starting; failures are returned by route id.
    pub async fn start_all(&self) -> Vec<(String, RouteError)> {
        let mut failures = Vec::new();
        for id in self.route_ids() {
            let Some(route) = self.get(&id) else { continue };
            if let Err(e) = route.start().await {
                warn!(route = %id, error = %e, "route did not start");
                failures.push((id, e));
            }
        }
        info!(routes = self.len(), failed = failures.len(), "routes started");
        failures
    }

    /// Stops every route in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure; every route is stopped regardless.
    pub async fn stop_all(&self) -> Result<(), RouteError> {
        let mut first = None;
        for id in self.route_ids().iter().rev() {
            let Some(route) = self.get(id) else { continue };
            if let Err(e) = route.stop().await {
                warn!(route = %id, error = %e, "route did not stop cleanly");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Default for RouteController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::processor::fn_processor;
    use crate::route::RouteLifecycleListener;

    struct OrderLog {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RouteLifecycleListener for OrderLog {
        async fn on_start(&self, route_id: &str) -> anyhow::Result<()> {
            self.log.lock().push(format!("start:{route_id}"));
            if route_id == "broken" {
                anyhow::bail!("cannot start");
            }
            Ok(())
        }

        async fn on_stop(&self, route_id: &str) -> anyhow::Result<()> {
            self.log.lock().push(format!("stop:{route_id}"));
            Ok(())
        }
    }

    fn route(id: &str, log: &Arc<Mutex<Vec<String>>>) -> Route {
        Route::builder(id)
            .step(fn_processor("noop", |_| {}))
            .listener(Arc::new(OrderLog { log: Arc::clone(log) }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn start_all_in_order_and_stop_all_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let controller = RouteController::new();
        controller.add(route("a", &log));
        controller.add(route("b", &log));

        assert!(controller.start_all().await.is_empty());
        controller.stop_all().await.unwrap();
        assert_eq!(*log.lock(), vec!["start:a", "start:b", "stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn failed_route_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let controller = RouteController::new();
        controller.add(route("broken", &log));
        controller.add(route("ok", &log));

        let failures = controller.start_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert_eq!(controller.status("ok").unwrap(), RouteStatus::Started);
        assert_eq!(controller.status("broken").unwrap(), RouteStatus::Stopped);
        assert!(controller.last_error("broken").unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_routes_are_errors() {
        let controller = RouteController::new();
        assert_eq!(
            controller.start("nope").await.unwrap_err(),
            RouteError::UnknownRoute("nope".into())
        );
        assert!(controller.health("nope").is_err());
    }

    #[tokio::test]
    async fn replace_keeps_position_and_remove_forgets() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let controller = RouteController::new();
        controller.add(route("a", &log));
        controller.add(route("b", &log));
        controller.add(route("a", &log));
        assert_eq!(controller.route_ids(), vec!["a", "b"]);

        assert!(controller.remove("a").is_some());
        assert_eq!(controller.route_ids(), vec!["b"]);
        assert_eq!(controller.health_all().len(), 1);
    }

    #[tokio::test]
    async fn suspend_resume_and_restart_through_controller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let controller = RouteController::new();
        controller.add(route("a", &log));
        controller.start("a").await.unwrap();

        controller.suspend("a").await.unwrap();
        assert_eq!(controller.status("a").unwrap(), RouteStatus::Suspended);
        controller.resume("a").await.unwrap();
        controller.restart("a", Duration::ZERO).await.unwrap();
        assert_eq!(controller.status("a").unwrap(), RouteStatus::Started);
        assert_eq!(*log.lock(), vec!["start:a", "stop:a", "start:a"]);
    }
}
