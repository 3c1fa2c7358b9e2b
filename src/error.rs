//! Error types for database operations

use thiserror::Error;

/// Database operation errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Database type not supported or not registered
    #[error("Unsupported database type: {0}")]
    UnsupportedDatabase(String),

    /// Invalid descriptor, DSN or pool configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to connect to database
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// SQL statement execution failed
    #[error("Query error: {0}")]
    QueryError(String),

    /// Requested schema/namespace does not exist or is not visible
    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    /// sqlx database error
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Coarse failure category used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request shape or unsupported engine; never retried
    Configuration,
    /// Host unreachable, authentication rejected, pool exhausted
    Connectivity,
    /// Malformed or semantically invalid SQL; transaction was rolled back
    Statement,
    /// Schema outside what the target exposes
    ScopeViolation,
}

impl DatabaseError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedDatabase(_) | Self::Configuration(_) | Self::UrlParse(_) => {
                ErrorKind::Configuration
            }
            Self::ConnectionError(_) => ErrorKind::Connectivity,
            Self::QueryError(_) => ErrorKind::Statement,
            Self::SchemaNotFound(_) => ErrorKind::ScopeViolation,
            Self::Sqlx(err) => classify_sqlx_error(err),
        }
    }

    /// Whether a retry on a fresh connection has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx(err) => is_connection_error(err),
            Self::ConnectionError(_) => true,
            _ => false,
        }
    }

    /// Message safe to show to an end user
    ///
    /// Connection strings and credentials never enter this crate's error
    /// messages, so this only normalizes the wording per category.
    pub fn public_message(&self) -> String {
        match self {
            Self::Sqlx(sqlx::Error::PoolTimedOut) => {
                "Connection error: timed out waiting for a database connection".to_string()
            }
            Self::Sqlx(sqlx::Error::Database(db_err)) => match self.kind() {
                ErrorKind::Connectivity => format!("Connection error: {}", db_err.message()),
                _ => format!("Query error: {}", db_err.message()),
            },
            Self::Sqlx(err) if self.kind() == ErrorKind::Connectivity => {
                format!("Connection error: {}", err)
            }
            other => other.to_string(),
        }
    }
}

/// Map a sqlx error onto the failure taxonomy
fn classify_sqlx_error(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Configuration(_) => ErrorKind::Configuration,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Connectivity,
        sqlx::Error::Database(db_err) => classify_database_error(db_err.as_ref()),
        _ => ErrorKind::Statement,
    }
}

/// Connection-level server errors, by SQLSTATE and (for MySQL) error number
fn classify_database_error(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> ErrorKind {
    #[cfg(feature = "mysql")]
    if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return match mysql_err.number() {
            // access denied (db / user), unknown database, too many connections,
            // can't connect, unknown host, lost connection
            1044 | 1045 | 1049 | 1040 | 2002 | 2003 | 2005 | 2013 => ErrorKind::Connectivity,
            _ => ErrorKind::Statement,
        };
    }

    match db_err.code().as_deref() {
        Some(code) if is_connectivity_sqlstate(code) => ErrorKind::Connectivity,
        _ => ErrorKind::Statement,
    }
}

fn is_connectivity_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("28")
        || matches!(code, "3D000" | "53300" | "57P01" | "57P02" | "57P03")
}

/// Check if a sqlx error is connection-related and retryable
pub(crate) fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_lowercase();
            msg.contains("connection")
                || msg.contains("broken pipe")
                || msg.contains("reset by peer")
                || msg.contains("closed")
        }
        _ => false,
    }
}
