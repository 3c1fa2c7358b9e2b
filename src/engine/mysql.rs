//! MySQL / MariaDB engine
//!
//! MySQL has no transaction-scoped schema setting, so every execution
//! issues a `USE` for the requested schema, or the descriptor's database
//! when none is given. A pooled session therefore never keeps the default
//! database of whoever used it last.
//!
//! DDL statements commit implicitly on MySQL; a batch that mixes DDL with
//! later failing statements cannot be fully rolled back.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::mysql::{
    MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions,
};
use sqlx::{Executor, Statement};
use std::sync::Arc;

use super::{DatabaseEngine, EngineDriver, PoolStatus, preview, quote_identifier};
use crate::config::{ExecutionSettings, PoolSettings};
use crate::descriptor::ConnectionDescriptor;
use crate::error::DatabaseError;
use crate::introspect::{Catalog, CatalogColumn, CatalogForeignKey, assemble};
use crate::row_converter::mysql_row_to_json;
use crate::sql_parser::split_statements;
use crate::timeout::execute_with_retry;
use crate::types::{DatabaseType, QueryResult, Row, SchemaDescription};

/// ER_UNSUPPORTED_PS: statement cannot run through the prepared protocol
const ER_UNSUPPORTED_PS: u16 = 1295;

const SCHEMA_EXISTS: &str =
    "SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = ?";

const TABLES: &str = "SELECT CAST(table_name AS CHAR) \
     FROM information_schema.tables \
     WHERE table_schema = ? AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

const COLUMNS: &str = "SELECT CAST(table_name AS CHAR), CAST(column_name AS CHAR), \
         CAST(column_type AS CHAR), CAST(is_nullable AS CHAR), CAST(column_key AS CHAR) \
     FROM information_schema.columns \
     WHERE table_schema = ? \
     ORDER BY table_name, ordinal_position";

const FOREIGN_KEYS: &str = "SELECT CAST(table_name AS CHAR), CAST(column_name AS CHAR), \
         CAST(referenced_table_name AS CHAR), CAST(referenced_column_name AS CHAR) \
     FROM information_schema.key_column_usage \
     WHERE table_schema = ? AND referenced_table_name IS NOT NULL \
     ORDER BY table_name, constraint_name, ordinal_position";

/// Builds [`MySqlEngine`]s
pub struct MySqlDriver;

impl EngineDriver for MySqlDriver {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn connect_lazy(
        &self,
        descriptor: &ConnectionDescriptor,
        pool: &PoolSettings,
        execution: &ExecutionSettings,
    ) -> Result<Arc<dyn DatabaseEngine>, DatabaseError> {
        let options = connect_options(descriptor);

        let pool = MySqlPoolOptions::new()
            .max_connections(pool.max_connections())
            .min_connections(0)
            .acquire_timeout(pool.connect_timeout())
            .idle_timeout(Some(pool.idle_timeout()))
            .max_lifetime(Some(pool.max_lifetime()))
            .test_before_acquire(pool.test_before_acquire)
            .connect_lazy_with(options);

        Ok(Arc::new(MySqlEngine {
            pool,
            database: descriptor.database_name.clone(),
            execution: execution.clone(),
        }))
    }
}

/// Connection options set field by field, so no part of the descriptor is
/// reinterpreted as URL syntax
fn connect_options(descriptor: &ConnectionDescriptor) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(&descriptor.username)
        .password(descriptor.password.expose_secret())
        .database(&descriptor.database_name)
}

/// Pooled MySQL target
pub struct MySqlEngine {
    pool: MySqlPool,
    /// Descriptor database, the default schema
    database: String,
    execution: ExecutionSettings,
}

impl MySqlEngine {
    async fn read_catalog(&self, schema: &str) -> Result<Catalog, DatabaseError> {
        let mut conn = self.pool.acquire().await?;

        let found: i64 = sqlx::query_scalar(SCHEMA_EXISTS)
            .bind(schema)
            .fetch_one(&mut *conn)
            .await?;
        if found == 0 {
            return Err(DatabaseError::SchemaNotFound(schema.to_string()));
        }

        let tables: Vec<String> = sqlx::query_scalar(TABLES)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?;

        let columns = sqlx::query_as::<_, (String, String, String, String, String)>(COLUMNS)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|(table, name, data_type, is_nullable, column_key)| CatalogColumn {
                table,
                name,
                data_type,
                nullable: is_nullable.eq_ignore_ascii_case("YES"),
                primary_key: column_key == "PRI",
            })
            .collect();

        let foreign_keys = sqlx::query_as::<_, (String, String, String, String)>(FOREIGN_KEYS)
            .bind(schema)
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
        conn: &mut MySqlConnection,
        schema: Option<&str>,
        sql: &str,
    ) -> Result<QueryResult, DatabaseError> {
        let target = schema.unwrap_or(self.database.as_str());
        let scope = format!("USE {}", quote_identifier(target, '`'));
        match (&mut *conn).execute(scope.as_str()).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) => {
                log::debug!("USE {} rejected: {}", target, e.message());
                return Err(DatabaseError::SchemaNotFound(target.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        // Server-side bound; MySQL applies it to SELECT statements only
        if let Some(limit) = self.execution.statement_timeout() {
            let bound = format!("SET SESSION max_execution_time = {}", limit.as_millis());
            (&mut *conn).execute(bound.as_str()).await?;
        }

        let statements = split_statements(sql, DatabaseType::MySQL);
        if statements.is_empty() {
            return Err(DatabaseError::QueryError("Empty SQL statement".to_string()));
        }

        let mut result = QueryResult::Success;
        for statement in &statements {
            log::debug!("Executing on MySQL: {}", preview(statement));
            result = run_statement(conn, statement).await?;
        }
        Ok(result)
    }
}

/// Prepare first: statements with result columns return rows, others the success marker
///
/// Statements the prepared protocol rejects are sent as plain text, see
/// [`text_protocol_result`].
async fn run_statement(
    conn: &mut MySqlConnection,
    statement: &str,
) -> Result<QueryResult, DatabaseError> {
    let returns_rows = match (&mut *conn).prepare(statement).await {
        Ok(prepared) => !prepared.columns().is_empty(),
        Err(e) if is_unsupported_ps(&e) => {
            let rows = (&mut *conn).fetch_all(statement).await?;
            let rows = rows
                .iter()
                .map(mysql_row_to_json)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(text_protocol_result(rows));
        }
        Err(e) => return Err(e.into()),
    };

    if returns_rows {
        let rows = sqlx::query(statement).fetch_all(&mut *conn).await?;
        let rows = rows
            .iter()
            .map(mysql_row_to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult::Rows(rows))
    } else {
        sqlx::query(statement).execute(&mut *conn).await?;
        Ok(QueryResult::Success)
    }
}

/// Outcome of a statement run over the text protocol
///
/// The text protocol carries column metadata only alongside rows, so an
/// empty result set cannot be told apart from a statement without one and
/// is reported as the success marker. Every SELECT can be prepared; only
/// statements such as `HELP` or some `SHOW` forms take this path.
fn text_protocol_result(rows: Vec<Row>) -> QueryResult {
    if rows.is_empty() {
        QueryResult::Success
    } else {
        QueryResult::Rows(rows)
    }
}

fn is_unsupported_ps(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|e| e.number() == ER_UNSUPPORTED_PS)
}

#[async_trait]
impl DatabaseEngine for MySqlEngine {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn describe(&self, schema: Option<&str>) -> Result<SchemaDescription, DatabaseError> {
        let schema = schema.unwrap_or(self.database.as_str());
        let catalog = execute_with_retry(
            &self.execution,
            self.execution.metadata_timeout(),
            "Reading MySQL catalog",
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
                log::warn!("Rolling back MySQL transaction: {}", err);
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
