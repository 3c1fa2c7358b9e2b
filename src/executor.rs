//! Transactional execution of generated SQL
//!
//! Each call runs on one pooled connection inside one transaction:
//!
//! 1. begin, scope the session to the schema
//! 2. run each statement; a statement is row-returning when its prepared
//!    form has result columns
//! 3. commit and return the last statement's result
//!
//! Any failure rolls the transaction back before the error is returned, so
//! nothing partial is committed and no transaction outlives the call.

use std::time::Instant;

use crate::connection::ConnectionHandle;
use crate::engine::preview;
use crate::error::DatabaseError;
use crate::types::QueryResult;

/// Execute `sql` on `handle`, scoped to `schema`
///
/// The SQL is passed through as given: no validation, rewriting or row
/// limits are applied.
pub async fn execute(
    handle: &ConnectionHandle,
    schema: Option<&str>,
    sql: &str,
) -> Result<QueryResult, DatabaseError> {
    let schema = schema.map(str::trim).filter(|s| !s.is_empty());
    let start = Instant::now();

    let result = handle.engine().execute(schema, sql).await;

    match &result {
        Ok(QueryResult::Rows(rows)) => log::debug!(
            "{} returned {} rows in {:?}",
            preview(sql),
            rows.len(),
            start.elapsed()
        ),
        Ok(QueryResult::Success) => {
            log::debug!("{} completed in {:?}", preview(sql), start.elapsed())
        }
        Err(e) => log::debug!("{} failed after {:?}: {}", preview(sql), start.elapsed(), e),
    }

    result
}
