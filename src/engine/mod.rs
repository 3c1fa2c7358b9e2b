//! Per-engine drivers behind a common interface
//!
//! An [`EngineDriver`] turns a descriptor into a lazily connected
//! [`DatabaseEngine`]. Drivers are looked up by [`DatabaseType`] in an
//! [`EngineRegistry`]; adding an engine means registering another driver.

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ExecutionSettings, PoolSettings};
use crate::descriptor::ConnectionDescriptor;
use crate::error::DatabaseError;
use crate::types::{DatabaseType, QueryResult, SchemaDescription};

/// Snapshot of a pool's connection counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open physical connections
    pub size: u32,
    /// Connections parked in the pool
    pub idle: u32,
    /// Connections currently checked out
    pub active: u32,
    pub max_connections: u32,
}

impl PoolStatus {
    pub fn new(size: u32, idle: u32, max_connections: u32) -> Self {
        Self {
            size,
            idle,
            active: size.saturating_sub(idle),
            max_connections,
        }
    }

    /// "EXHAUSTED", "BUSY" or "HEALTHY"
    pub fn health(&self) -> &'static str {
        if self.max_connections > 0 && self.active >= self.max_connections {
            "EXHAUSTED"
        } else if self.idle == 0 && self.active > 0 {
            "BUSY"
        } else {
            "HEALTHY"
        }
    }
}

/// A pooled connection target for one engine
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Describe every table under `schema`, or the engine default when `None`
    async fn describe(&self, schema: Option<&str>) -> Result<SchemaDescription, DatabaseError>;

    /// Run `sql` in one transaction scoped to `schema`
    async fn execute(&self, schema: Option<&str>, sql: &str) -> Result<QueryResult, DatabaseError>;

    fn pool_status(&self) -> PoolStatus;

    /// Close every connection; later checkouts fail
    async fn close(&self);
}

/// Factory for one engine type
pub trait EngineDriver: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Build a lazily connected engine; no I/O happens here
    fn connect_lazy(
        &self,
        descriptor: &ConnectionDescriptor,
        pool: &PoolSettings,
        execution: &ExecutionSettings,
    ) -> Result<Arc<dyn DatabaseEngine>, DatabaseError>;
}

/// Engine types this process can connect to
#[derive(Clone, Default)]
pub struct EngineRegistry {
    drivers: HashMap<DatabaseType, Arc<dyn EngineDriver>>,
}

impl EngineRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every engine compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(postgres::PostgresDriver));
        #[cfg(feature = "mysql")]
        registry.register(Arc::new(mysql::MySqlDriver));
        registry
    }

    /// Register a driver, replacing any previous one for the same engine
    pub fn register(&mut self, driver: Arc<dyn EngineDriver>) {
        self.drivers.insert(driver.db_type(), driver);
    }

    pub fn get(&self, db_type: DatabaseType) -> Result<Arc<dyn EngineDriver>, DatabaseError> {
        self.drivers
            .get(&db_type)
            .cloned()
            .ok_or_else(|| DatabaseError::UnsupportedDatabase(db_type.as_str().to_string()))
    }

    pub fn supports(&self, db_type: DatabaseType) -> bool {
        self.drivers.contains_key(&db_type)
    }
}

/// Quote an identifier with `quote`, doubling embedded quote characters
pub(crate) fn quote_identifier(name: &str, quote: char) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(quote);
    for c in name.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    quoted
}

/// First 80 characters of a statement, for log lines
pub(crate) fn preview(sql: &str) -> String {
    let mut shown: String = sql.chars().take(80).collect();
    if shown.len() < sql.len() {
        shown.push_str("...");
    }
    shown.replace('\n', " ")
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory engine used by resolver, service and HTTP tests

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Calls received by a [`FakeEngine`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Describe(Option<String>),
        Execute(Option<String>, String),
    }

    pub struct FakeEngine {
        db_type: DatabaseType,
        pub calls: Mutex<Vec<Call>>,
        description: SchemaDescription,
        respond: Box<dyn Fn(&str) -> Result<QueryResult, DatabaseError> + Send + Sync>,
    }

    impl FakeEngine {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl DatabaseEngine for FakeEngine {
        fn db_type(&self) -> DatabaseType {
            self.db_type
        }

        async fn describe(&self, schema: Option<&str>) -> Result<SchemaDescription, DatabaseError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Describe(schema.map(str::to_string)));
            match schema {
                Some("missing") => Err(DatabaseError::SchemaNotFound("missing".to_string())),
                _ => Ok(self.description.clone()),
            }
        }

        async fn execute(&self, schema: Option<&str>, sql: &str) -> Result<QueryResult, DatabaseError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Execute(schema.map(str::to_string), sql.to_string()));
            (self.respond)(sql)
        }

        fn pool_status(&self) -> PoolStatus {
            PoolStatus::new(0, 0, 15)
        }

        async fn close(&self) {}
    }

    /// Driver handing out [`FakeEngine`]s and remembering the last one
    pub struct FakeDriver {
        db_type: DatabaseType,
        description: SchemaDescription,
        respond: Arc<dyn Fn(&str) -> Result<QueryResult, DatabaseError> + Send + Sync>,
        pub connects: AtomicUsize,
        pub last: Mutex<Option<Arc<FakeEngine>>>,
    }

    impl FakeDriver {
        pub fn new(db_type: DatabaseType) -> Self {
            Self::with_responder(db_type, SchemaDescription::default(), |_| {
                Ok(QueryResult::Success)
            })
        }

        pub fn with_responder(
            db_type: DatabaseType,
            description: SchemaDescription,
            respond: impl Fn(&str) -> Result<QueryResult, DatabaseError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                db_type,
                description,
                respond: Arc::new(respond),
                connects: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn last_engine(&self) -> Arc<FakeEngine> {
            self.last.lock().unwrap().clone().expect("no engine created")
        }
    }

    impl EngineDriver for FakeDriver {
        fn db_type(&self) -> DatabaseType {
            self.db_type
        }

        fn connect_lazy(
            &self,
            _descriptor: &ConnectionDescriptor,
            _pool: &PoolSettings,
            _execution: &ExecutionSettings,
        ) -> Result<Arc<dyn DatabaseEngine>, DatabaseError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let respond = self.respond.clone();
            let engine = Arc::new(FakeEngine {
                db_type: self.db_type,
                calls: Mutex::new(Vec::new()),
                description: self.description.clone(),
                respond: Box::new(move |sql| respond(sql)),
            });
            *self.last.lock().unwrap() = Some(engine.clone());
            Ok(engine)
        }
    }
}
