//! PostgreSQL engine
//!
//! Introspection reads `pg_catalog` filtered to one namespace. Execution
//! scopes each transaction with `SET LOCAL search_path` (and, when
//! configured, `SET LOCAL statement_timeout`), which revert on commit or
//! rollback, so a pooled session never carries a previous tenant's schema.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::{Executor, Statement};
use std::sync::Arc;

use super::{DatabaseEngine, EngineDriver, PoolStatus, preview, quote_identifier};
use crate::config::{ExecutionSettings, PoolSettings};
use crate::descriptor::ConnectionDescriptor;
use crate::error::DatabaseError;
use crate::introspect::{Catalog, CatalogColumn, CatalogForeignKey, assemble};
use crate::row_converter::pg_row_to_json;
use crate::sql_parser::split_statements;
use crate::timeout::execute_with_retry;
use crate::types::{DatabaseType, QueryResult, SchemaDescription};

const SCHEMA_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)";

const TABLES: &str = "SELECT c.relname::text \
     FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') AND NOT c.relispartition \
     ORDER BY c.relname";

const COLUMNS: &str = "SELECT c.relname::text, a.attname::text, \
         pg_catalog.format_type(a.atttypid, a.atttypmod), \
         NOT a.attnotnull, \
         EXISTS ( \
             SELECT 1 FROM pg_catalog.pg_constraint pk \
             WHERE pk.conrelid = c.oid AND pk.contype = 'p' AND a.attnum = ANY(pk.conkey) \
         ) \
     FROM pg_catalog.pg_attribute a \
     JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') \
       AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY c.relname, a.attnum";

const FOREIGN_KEYS: &str = "SELECT cl.relname::text, att.attname::text, \
         rcl.relname::text, ratt.attname::text \
     FROM pg_catalog.pg_constraint con \
     JOIN pg_catalog.pg_class cl ON cl.oid = con.conrelid \
     JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace \
     JOIN pg_catalog.pg_class rcl ON rcl.oid = con.confrelid \
     CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, refnum, ord) \
     JOIN pg_catalog.pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum \
     JOIN pg_catalog.pg_attribute ratt ON ratt.attrelid = con.confrelid AND ratt.attnum = k.refnum \
     WHERE con.contype = 'f' AND n.nspname = $1 \
     ORDER BY cl.relname, con.conname, k.ord";

/// Builds [`PostgresEngine`]s
pub struct PostgresDriver;

impl EngineDriver for PostgresDriver {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn connect_lazy(
        &self,
        descriptor: &ConnectionDescriptor,
        pool: &PoolSettings,
        execution: &ExecutionSettings,
    ) -> Result<Arc<dyn DatabaseEngine>, DatabaseError> {
        let options = connect_options(descriptor);

        let pool = PgPoolOptions::new()
            .max_connections(pool.max_connections())
            .min_connections(0)
            .acquire_timeout(pool.connect_timeout())
            .idle_timeout(Some(pool.idle_timeout()))
            .max_lifetime(Some(pool.max_lifetime()))
            .test_before_acquire(pool.test_before_acquire)
            .connect_lazy_with(options);

        Ok(Arc::new(PostgresEngine {
            pool,
            execution: execution.clone(),
        }))
    }
}

/// Connection options set field by field, so no part of the descriptor is
/// reinterpreted as URL syntax
fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    PgConnectOptions::new_without_pgpass()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(&descriptor.username)
        .password(descriptor.password.expose_secret())
        .database(&descriptor.database_name)
        .application_name("text2sql-db")
}

/// Pooled PostgreSQL target
pub struct PostgresEngine {
    pool: PgPool,
    execution: ExecutionSettings,
}

impl PostgresEngine {
    async fn read_catalog(&self, schema: Option<&str>) -> Result<Catalog, DatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let schema = match schema {
            Some(schema) => schema.to_string(),
            None => sqlx::query_scalar::<_, Option<String>>("SELECT current_schema()::text")
                .fetch_one(&mut *conn)
                .await?
                .ok_or_else(|| {
                    DatabaseError::SchemaNotFound(
                        "no current schema (search_path is empty)".to_string(),
                    )
                })?,
        };

        ensure_schema(&mut conn, &schema).await?;

        let tables: Vec<String> = sqlx::query_scalar(TABLES)
            .bind(&schema)
            .fetch_all(&mut *conn)
            .await?;

        let columns = sqlx::query_as::<_, (String, String, String, bool, bool)>(COLUMNS)
            .bind(&schema)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|(table, name, data_type, nullable, primary_key)| CatalogColumn {
                table,
                name,
                data_type,
                nullable,
                primary_key,
            })
            .collect();

        let foreign_keys = sqlx::query_as::<_, (String, String, String, String)>(FOREIGN_KEYS)
            .bind(&schema)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(
                |(table, column, referenced_table, referenced_column)| CatalogForeignKey {
                    table,
                    column,
                    referenced_table,
                    referenced_column,
                },
            )
            .collect();

        Ok(Catalog {
            tables,
            columns,
            foreign_keys,
        })
    }

    /// Everything between BEGIN and COMMIT
    async fn run_scoped(
        &self,
        conn: &mut PgConnection,
        schema: Option<&str>,
        sql: &str,
    ) -> Result<QueryResult, DatabaseError> {
        if let Some(schema) = schema {
            ensure_schema(conn, schema).await?;
            let scope = format!("SET LOCAL search_path TO {}", quote_identifier(schema, '"'));
            (&mut *conn).execute(scope.as_str()).await?;
        }
        if let Some(limit) = self.execution.statement_timeout() {
            let bound = format!("SET LOCAL statement_timeout = {}", limit.as_millis());
            (&mut *conn).execute(bound.as_str()).await?;
        }

        let statements = split_statements(sql, DatabaseType::Postgres);
        if statements.is_empty() {
            return Err(DatabaseError::QueryError("Empty SQL statement".to_string()));
        }

        let mut result = QueryResult::Success;
        for statement in &statements {
            log::debug!("Executing on PostgreSQL: {}", preview(statement));
            result = run_statement(conn, statement).await?;
        }
        Ok(result)
    }
}

/// Prepare first: statements with result columns return rows, others the success marker
async fn run_statement(
    conn: &mut PgConnection,
    statement: &str,
) -> Result<QueryResult, DatabaseError> {
    let returns_rows = {
        let prepared = (&mut *conn).prepare(statement).await?;
        !prepared.columns().is_empty()
    };

    if returns_rows {
        let rows = sqlx::query(statement).fetch_all(&mut *conn).await?;
        let rows = rows
            .iter()
            .map(pg_row_to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult::Rows(rows))
    } else {
        sqlx::query(statement).execute(&mut *conn).await?;
        Ok(QueryResult::Success)
    }
}

async fn ensure_schema(conn: &mut PgConnection, schema: &str) -> Result<(), DatabaseError> {
    let exists: bool = sqlx::query_scalar(SCHEMA_EXISTS)
        .bind(schema)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(DatabaseError::SchemaNotFound(schema.to_string()))
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn describe(&self, schema: Option<&str>) -> Result<SchemaDescription, DatabaseError> {
        let catalog = execute_with_retry(
            &self.execution,
            self.execution.metadata_timeout(),
            "Reading PostgreSQL catalog",
            move || self.read_catalog(schema),
        )
        .await?;
        Ok(assemble(catalog))
    }

    async fn execute(&self, schema: Option<&str>, sql: &str) -> Result<QueryResult, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        match self.run_scoped(&mut tx, schema, sql).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(err) => {
                log::warn!("Rolling back PostgreSQL transaction: {}", err);
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus::new(
            self.pool.size(),
            u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX),
            self.pool.options().get_max_connections(),
        )
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new(
            DatabaseType::Postgres,
            "127.0.0.1",
            1,
            "postgres",
            "p@ss:w/rd",
            "test_db",
        )
    }

    #[test]
    fn connect_options_keep_url_syntax_literal() {
        let target = ConnectionDescriptor::new(
            DatabaseType::Postgres,
            "db.internal",
            5433,
            "app@corp",
            "p@ss:w/rd#1",
            "test_db#other",
        );
        let options = connect_options(&target);
        assert_eq!(options.get_database(), Some("test_db#other"));
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "app@corp");
    }

    #[tokio::test]
    async fn lazy_pool_applies_pool_settings() {
        let settings = PoolSettings {
            pool_size: 2,
            max_overflow: 3,
            ..PoolSettings::default()
        };
        let engine = PostgresDriver
            .connect_lazy(&descriptor(), &settings, &ExecutionSettings::default())
            .unwrap();

        assert_eq!(engine.db_type(), DatabaseType::Postgres);
        let status = engine.pool_status();
        assert_eq!(status.max_connections, 5);
        assert_eq!(status.size, 0);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn unreachable_server_fails_on_first_use() {
        let settings = PoolSettings {
            connect_timeout_secs: 1,
            ..PoolSettings::default()
        };
        let engine = PostgresDriver
            .connect_lazy(&descriptor(), &settings, &ExecutionSettings::default())
            .unwrap();

        let err = engine.execute(None, "SELECT 1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
        assert!(!err.public_message().contains("p@ss"));
    }
}
