use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to services during initialization.
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    pub config: Arc<EngineConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed collaborator: repositories, saga services, anything a
/// route or the engine context must set up before use and release afterwards.
///
/// Services are initialized in registration order and shut down in reverse
/// registration order. The `Any` bound enables type-based lookup via
/// `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Returns the unique name of this service within its registry.
    fn name(&self) -> &str;

    /// Initialize the service with the given context.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Shut down the service. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed services.
///
/// Provides two lookup mechanisms:
/// - **By name** (`get_by_name`): uses the service's `name()` string
/// - **By type** (`get::<T>`): uses `TypeId`; the most recent registration
///   of a type wins
///
/// This is the explicit registry object handed to whatever needs shared
/// collaborators; nothing in the engine is a process-wide singleton.
pub struct ServiceRegistry {
    by_name: DashMap<String, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order for deterministic init/shutdown sequencing.
    init_order: RwLock<Vec<String>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service by value.
    pub fn register<T: ManagedService>(&self, service: T) -> Arc<T> {
        let arc = Arc::new(service);
        self.register_arc(Arc::clone(&arc));
        arc
    }

    /// Register a service that is already shared with other components.
    ///
    /// Re-registering a name replaces the previous service but keeps its
    /// original position in the init order.
    pub fn register_arc<T: ManagedService>(&self, service: Arc<T>) {
        let name = service.name().to_string();
        let previous = self
            .by_name
            .insert(name.clone(), Arc::clone(&service) as Arc<dyn ManagedService>);
        self.by_type.insert(TypeId::of::<T>(), service);
        if previous.is_none() {
            self.init_order.write().push(name);
        }
    }

    /// Retrieve a service by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all registered services, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.init_order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.init_order.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.init_order.read().is_empty()
    }

    /// Initialize all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `init()` call fails; later services
    /// are not initialized.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let order = self.names();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                service.init(ctx).await?;
            }
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    ///
    /// Every service is shut down even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown failure.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.names();
        let mut first_error = None;
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(e) = service.shutdown(terminate).await {
                    tracing::warn!(service = %name, error = %e, "service shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Test service that tracks lifecycle calls.
    struct TestService {
        svc_name: &'static str,
        fail_shutdown: bool,
        init_counter: AtomicU32,
        order_log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl TestService {
        fn new(name: &'static str, order_log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            Self {
                svc_name: name,
                fail_shutdown: false,
                init_counter: AtomicU32::new(0),
                order_log,
            }
        }
    }

    #[async_trait]
    impl ManagedService for TestService {
        fn name(&self) -> &str {
            self.svc_name
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.init_counter.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().push(format!("init:{}", self.svc_name));
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.order_log
                .lock()
                .push(format!("shutdown:{}", self.svc_name));
            if self.fail_shutdown {
                anyhow::bail!("{} refused to stop", self.svc_name);
            }
            Ok(())
        }
    }

    /// A distinct service type for type-based lookup testing.
    struct AnotherService;

    #[async_trait]
    impl ManagedService for AnotherService {
        fn name(&self) -> &str {
            "another"
        }
        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_get_by_name_and_type() {
        let registry = ServiceRegistry::new();
        registry.register(AnotherService);

        assert_eq!(registry.get_by_name("another").unwrap().name(), "another");
        assert!(registry.get::<AnotherService>().is_some());
        assert!(registry.get_by_name("missing").is_none());
        assert!(registry.get::<TestService>().is_none());
    }

    #[test]
    fn register_arc_shares_the_instance() {
        let registry = ServiceRegistry::new();
        let shared = Arc::new(AnotherService);
        registry.register_arc(Arc::clone(&shared));
        let found = registry.get::<AnotherService>().unwrap();
        assert!(Arc::ptr_eq(&shared, &found));
    }

    #[test]
    fn reregistering_a_name_keeps_one_entry() {
        let registry = ServiceRegistry::new();
        registry.register(AnotherService);
        registry.register(AnotherService);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn init_all_calls_in_registration_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone()));
        registry.register(TestService::new("second", log.clone()));
        registry.register(TestService::new("third", log.clone()));

        registry.init_all(&ServiceContext::default()).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["init:first", "init:second", "init:third"]
        );
        assert_eq!(
            registry.get::<TestService>().unwrap().init_counter.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_all_continues_past_failures() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone()));
        let mut failing = TestService::new("second", log.clone());
        failing.fail_shutdown = true;
        registry.register(failing);
        registry.register(TestService::new("third", log.clone()));

        let result = registry.shutdown_all(false).await;
        assert!(result.is_err());
        assert_eq!(
            *log.lock(),
            vec!["shutdown:third", "shutdown:second", "shutdown:first"]
        );
    }
}
