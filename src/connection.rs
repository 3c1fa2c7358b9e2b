//! Connection resolution and pooling
//!
//! [`ConnectionResolver::resolve`] maps a [`ConnectionDescriptor`] onto a
//! pooled [`ConnectionHandle`]. Handles live in an injected [`PoolCache`]
//! keyed by descriptor fingerprint, so repeated requests against the same
//! target share one pool. Pools connect lazily: nothing touches the network
//! until the first statement checks a connection out.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{ExecutionSettings, PoolSettings};
use crate::descriptor::{ConnectionDescriptor, Fingerprint};
use crate::engine::{DatabaseEngine, EngineRegistry, PoolStatus};
use crate::error::DatabaseError;
use crate::types::DatabaseType;

/// Pooled, reusable connection target bound to one fingerprint
#[derive(Clone)]
pub struct ConnectionHandle {
    fingerprint: Fingerprint,
    engine: Arc<dyn DatabaseEngine>,
}

impl ConnectionHandle {
    pub fn new(fingerprint: Fingerprint, engine: Arc<dyn DatabaseEngine>) -> Self {
        Self {
            fingerprint,
            engine,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn db_type(&self) -> DatabaseType {
        self.engine.db_type()
    }

    pub fn engine(&self) -> &Arc<dyn DatabaseEngine> {
        &self.engine
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.engine.pool_status()
    }

    /// Whether both handles share the same underlying pool
    pub fn same_pool(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("fingerprint", &self.fingerprint)
            .field("db_type", &self.db_type())
            .field("pool", &self.pool_status())
            .finish()
    }
}

/// Process-wide store of connection handles
///
/// Owned by the composition root and shared with every resolver. Entries
/// are never evicted implicitly; use [`PoolCache::remove`] or
/// [`PoolCache::clear`] to drop a pool.
#[derive(Default)]
pub struct PoolCache {
    handles: Mutex<HashMap<Fingerprint, ConnectionHandle>>,
}

impl PoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<ConnectionHandle> {
        self.handles.lock().await.get(fingerprint).cloned()
    }

    /// Cached handle for `fingerprint`, building it with `build` on a miss
    ///
    /// The lock is held across `build`, so concurrent callers for the same
    /// fingerprint observe exactly one construction. `build` must not block.
    pub async fn get_or_try_insert_with<F>(
        &self,
        fingerprint: Fingerprint,
        build: F,
    ) -> Result<ConnectionHandle, DatabaseError>
    where
        F: FnOnce() -> Result<Arc<dyn DatabaseEngine>, DatabaseError>,
    {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&fingerprint) {
            return Ok(handle.clone());
        }
        let handle = ConnectionHandle::new(fingerprint.clone(), build()?);
        handles.insert(fingerprint, handle.clone());
        Ok(handle)
    }

    /// Drop and close the pool for `fingerprint`
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Option<ConnectionHandle> {
        let removed = self.handles.lock().await.remove(fingerprint);
        if let Some(handle) = &removed {
            handle.engine.close().await;
        }
        removed
    }

    /// Drop and close every pool
    pub async fn clear(&self) {
        let drained: Vec<ConnectionHandle> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.engine.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    pub async fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut keys: Vec<Fingerprint> = self.handles.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Turns descriptors into pooled handles
#[derive(Clone)]
pub struct ConnectionResolver {
    cache: Arc<PoolCache>,
    registry: Arc<EngineRegistry>,
    pool: PoolSettings,
    execution: ExecutionSettings,
}

impl ConnectionResolver {
    pub fn new(
        cache: Arc<PoolCache>,
        registry: Arc<EngineRegistry>,
        pool: PoolSettings,
        execution: ExecutionSettings,
    ) -> Self {
        Self {
            cache,
            registry,
            pool,
            execution,
        }
    }

    pub fn cache(&self) -> &Arc<PoolCache> {
        &self.cache
    }

    pub fn execution(&self) -> &ExecutionSettings {
        &self.execution
    }

    /// Pooled handle for `descriptor`
    ///
    /// # Errors
    /// - [`DatabaseError::UnsupportedDatabase`] if no driver is registered
    ///   for the descriptor's engine
    /// - [`DatabaseError::Configuration`] if the descriptor is incomplete or
    ///   its connection URL is rejected by the driver
    ///
    /// Connectivity and authentication errors surface on first use.
    pub async fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, DatabaseError> {
        let driver = self.registry.get(descriptor.db_type)?;
        descriptor.validate()?;

        self.cache
            .get_or_try_insert_with(descriptor.fingerprint(), || {
                let engine = driver.connect_lazy(descriptor, &self.pool, &self.execution)?;
                log::info!(
                    "Created {} pool for {} (max {} connections)",
                    descriptor.db_type,
                    descriptor.to_safe_dsn(),
                    self.pool.max_connections()
                );
                Ok(engine)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeDriver;

    fn resolver_with(driver: Arc<FakeDriver>) -> ConnectionResolver {
        let mut registry = EngineRegistry::new();
        registry.register(driver);
        ConnectionResolver::new(
            Arc::new(PoolCache::new()),
            Arc::new(registry),
            PoolSettings::default(),
            ExecutionSettings::default(),
        )
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new(
            DatabaseType::Postgres,
            "localhost",
            5432,
            "postgres",
            "secret",
            "test_db",
        )
    }

    #[tokio::test]
    async fn same_fingerprint_reuses_handle() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver.clone());

        let a = resolver.resolve(&descriptor()).await.unwrap();
        let b = resolver
            .resolve(&descriptor().with_schema("inventory"))
            .await
            .unwrap();

        assert!(a.same_pool(&b));
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(resolver.cache().len().await, 1);
    }

    #[tokio::test]
    async fn distinct_targets_get_distinct_handles() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver.clone());

        let a = resolver.resolve(&descriptor()).await.unwrap();
        let other = ConnectionDescriptor {
            database_name: "other_db".to_string(),
            ..descriptor()
        };
        let b = resolver.resolve(&other).await.unwrap();

        assert!(!a.same_pool(&b));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_resolves_build_one_pool() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver.clone());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolver.resolve(&descriptor()).await.map(|h| h.fingerprint().clone())
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn unregistered_engine_is_unsupported() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver);

        let mysql = ConnectionDescriptor::new(DatabaseType::MySQL, "h", 3306, "u", "p", "db");
        let err = resolver.resolve(&mysql).await.unwrap_err();
        assert!(matches!(err, DatabaseError::UnsupportedDatabase(ref t) if t == "mysql"));
    }

    #[tokio::test]
    async fn incomplete_descriptor_is_rejected_before_pooling() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver.clone());

        let bad = ConnectionDescriptor {
            host: String::new(),
            ..descriptor()
        };
        assert!(matches!(
            resolver.resolve(&bad).await,
            Err(DatabaseError::Configuration(_))
        ));
        assert_eq!(driver.connect_count(), 0);
        assert!(resolver.cache().is_empty().await);
    }

    #[tokio::test]
    async fn removed_pool_is_rebuilt_on_next_resolve() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let resolver = resolver_with(driver.clone());

        let first = resolver.resolve(&descriptor()).await.unwrap();
        assert!(resolver.cache().remove(first.fingerprint()).await.is_some());
        let second = resolver.resolve(&descriptor()).await.unwrap();

        assert!(!first.same_pool(&second));
        assert_eq!(driver.connect_count(), 2);

        resolver.cache().clear().await;
        assert!(resolver.cache().is_empty().await);
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn real_driver_builds_lazily_without_a_server() {
        // Nothing listens on port 1; resolve must still succeed
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(crate::engine::postgres::PostgresDriver));
        let resolver = ConnectionResolver::new(
            Arc::new(PoolCache::new()),
            Arc::new(registry),
            PoolSettings::default(),
            ExecutionSettings::default(),
        );

        let unreachable = ConnectionDescriptor {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..descriptor()
        };
        let handle = resolver.resolve(&unreachable).await.unwrap();
        let status = handle.pool_status();
        assert_eq!(status.size, 0);
        assert_eq!(status.max_connections, 15);
    }
}
