//! Query service: the single entry point upstream features use
//!
//! Every call carries its own [`ConnectionDescriptor`]; the service holds
//! no per-target state beyond the shared pool cache inside its resolver.

use std::sync::Arc;

use crate::config::Settings;
use crate::connection::{ConnectionResolver, PoolCache};
use crate::descriptor::ConnectionDescriptor;
use crate::engine::EngineRegistry;
use crate::error::DatabaseError;
use crate::types::{QueryResult, SchemaDescription};
use crate::{executor, introspect, sanitize};

#[derive(Clone)]
pub struct QueryService {
    resolver: ConnectionResolver,
}

impl QueryService {
    pub fn new(resolver: ConnectionResolver) -> Self {
        Self { resolver }
    }

    /// Service over a fresh cache with every compiled-in engine registered
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(ConnectionResolver::new(
            Arc::new(PoolCache::new()),
            Arc::new(EngineRegistry::with_defaults()),
            settings.pool.clone(),
            settings.execution.clone(),
        ))
    }

    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    /// Live structure of the descriptor's schema
    pub async fn get_structure(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SchemaDescription, DatabaseError> {
        let handle = self.resolver.resolve(descriptor).await?;
        introspect::describe(&handle, descriptor.schema()).await
    }

    /// Structure rendered as prompt text for SQL generation
    pub async fn prompt_context(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<String, DatabaseError> {
        Ok(self.get_structure(descriptor).await?.to_prompt_context())
    }

    /// Clean LLM output and run it in one transaction on the descriptor's schema
    pub async fn run(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> Result<QueryResult, DatabaseError> {
        let handle = self.resolver.resolve(descriptor).await?;
        let sql = sanitize::clean(sql);
        if sql.is_empty() {
            return Err(DatabaseError::QueryError("Empty SQL statement".to_string()));
        }
        executor::execute(&handle, descriptor.schema(), &sql).await
    }

    /// Close every cached pool
    pub async fn shutdown(&self) {
        let pools = self.resolver.cache().len().await;
        self.resolver.cache().clear().await;
        log::info!("Closed {} connection pools", pools);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionSettings, PoolSettings};
    use crate::engine::testing::{Call, FakeDriver};
    use crate::types::{ColumnDescriptor, DatabaseType, TableDescription};

    fn service_with(driver: Arc<FakeDriver>) -> QueryService {
        let mut registry = EngineRegistry::new();
        registry.register(driver);
        QueryService::new(ConnectionResolver::new(
            Arc::new(PoolCache::new()),
            Arc::new(registry),
            PoolSettings::default(),
            ExecutionSettings::default(),
        ))
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
        .with_schema("inventory")
    }

    fn products() -> SchemaDescription {
        SchemaDescription {
            tables: vec![TableDescription {
                name: "products".to_string(),
                columns: vec![ColumnDescriptor {
                    name: "stock".to_string(),
                    data_type: "integer".to_string(),
                    nullable: true,
                    primary_key: false,
                }],
                foreign_keys: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn run_cleans_fences_and_scopes_to_schema() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let service = service_with(driver.clone());

        let result = service
            .run(
                &descriptor(),
                "```sql\nSELECT * FROM products WHERE stock < 10\n```",
            )
            .await
            .unwrap();

        assert!(result.is_success_marker());
        assert_eq!(
            driver.last_engine().calls(),
            vec![Call::Execute(
                Some("inventory".to_string()),
                "SELECT * FROM products WHERE stock < 10".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn fence_only_input_is_rejected_without_touching_the_engine() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let service = service_with(driver.clone());

        let err = service.run(&descriptor(), "```sql\n```").await.unwrap_err();
        assert!(matches!(err, DatabaseError::QueryError(_)));
        assert!(driver.last_engine().calls().is_empty());
    }

    #[tokio::test]
    async fn structure_uses_descriptor_schema() {
        let driver = Arc::new(FakeDriver::with_responder(
            DatabaseType::Postgres,
            products(),
            |_| Ok(QueryResult::Success),
        ));
        let service = service_with(driver.clone());

        let structure = service.get_structure(&descriptor()).await.unwrap();
        assert_eq!(structure.table_names(), vec!["products"]);

        let text = service.prompt_context(&descriptor()).await.unwrap();
        assert_eq!(text, "Table: products, Columns: stock (integer)");

        assert_eq!(
            driver.last_engine().calls(),
            vec![
                Call::Describe(Some("inventory".to_string())),
                Call::Describe(Some("inventory".to_string())),
            ]
        );
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn missing_schema_is_not_masked() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let service = service_with(driver);

        let err = service
            .get_structure(&descriptor().with_schema("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::SchemaNotFound(_)));
    }

    #[tokio::test]
    async fn statement_errors_propagate() {
        let driver = Arc::new(FakeDriver::with_responder(
            DatabaseType::Postgres,
            SchemaDescription::default(),
            |_| Err(DatabaseError::QueryError("relation \"prodcts\" does not exist".to_string())),
        ));
        let service = service_with(driver);

        let err = service
            .run(&descriptor(), "SELECT * FROM prodcts")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prodcts"));
    }

    #[tokio::test]
    async fn shutdown_drops_cached_pools() {
        let driver = Arc::new(FakeDriver::new(DatabaseType::Postgres));
        let service = service_with(driver.clone());

        service.run(&descriptor(), "SELECT 1").await.unwrap();
        assert_eq!(service.resolver().cache().len().await, 1);

        service.shutdown().await;
        assert!(service.resolver().cache().is_empty().await);
    }
}
