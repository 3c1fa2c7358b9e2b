//! Dynamic multi-database query layer for text-to-SQL
//!
//! Given connection credentials supplied at call time, this crate pools a
//! connection to an arbitrary PostgreSQL or MySQL instance, introspects the
//! live schema of one namespace, and executes LLM-generated SQL inside a
//! transaction, normalizing the outcome into rows or a success marker.
//!
//! [`QueryService`] is the entry point; [`server`] exposes it over HTTP.

pub mod alerts;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod row_converter;
pub mod sanitize;
pub mod server;
pub mod service;
pub mod sql_parser;
pub mod timeout;
pub mod types;

// Re-export secrecy types for consumers
pub use secrecy::{ExposeSecret, SecretString};

// Re-exports
pub use alerts::{Alert, AlertChecker, AlertNotifier, AlertSweep};
pub use config::Settings;
pub use connection::{ConnectionHandle, ConnectionResolver, PoolCache};
pub use descriptor::{ConnectionDescriptor, Fingerprint};
pub use engine::{DatabaseEngine, EngineDriver, EngineRegistry, PoolStatus};
pub use error::{DatabaseError, ErrorKind};
pub use sanitize::clean;
pub use service::QueryService;
pub use sql_parser::split_statements;
pub use types::{
    ColumnDescriptor, DatabaseType, ForeignKeyDescriptor, QueryResult, Row, SchemaDescription,
    TableDescription,
};
