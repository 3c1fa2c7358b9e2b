//! Type definitions for database operations

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::str::FromStr;

use crate::error::DatabaseError;

/// Message carried by the success marker of non-row-returning statements
pub const SUCCESS_MESSAGE: &str = "Query executed successfully";

/// One result row: column name to driver value, in select-list order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Database engine behind a connection descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatabaseType {
    Postgres,
    MySQL,
}

impl DatabaseType {
    /// Wire name, as accepted in requests and used in fingerprints
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgresql",
            Self::MySQL => "mysql",
        }
    }

    /// URL scheme understood by the sqlx driver
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
        }
    }

    /// Default TCP port for the engine
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySQL => 3306,
        }
    }
}

impl FromStr for DatabaseType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            other => Err(DatabaseError::UnsupportedDatabase(other.to_string())),
        }
    }
}

impl TryFrom<String> for DatabaseType {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatabaseType> for String {
    fn from(value: DatabaseType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "PostgreSQL"),
            Self::MySQL => write!(f, "MySQL"),
        }
    }
}

/// Table column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,

    /// Type as rendered by the engine (e.g. "character varying(50)", "int")
    #[serde(rename = "type")]
    pub data_type: String,

    /// Whether column accepts NULL values
    pub nullable: bool,

    /// Whether column is part of the primary key
    pub primary_key: bool,
}

/// Foreign key edge from a local column to a referenced column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyDescriptor {
    /// Local column name
    pub column: String,

    /// Referenced table name
    pub references: String,

    /// Referenced column name
    pub referenced_column: String,
}

/// Columns and foreign keys of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescription {
    #[serde(skip)]
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

/// Live structure of one schema, tables in dependency order
///
/// Serializes as a JSON object keyed by table name; key order is the
/// dependency order, so referenced tables come first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescription>,
}

impl SchemaDescription {
    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

impl Serialize for SchemaDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tables.len()))?;
        for table in &self.tables {
            map.serialize_entry(&table.name, table)?;
        }
        map.end()
    }
}

/// Normalized outcome of executing a statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Row-returning statement; possibly empty
    Rows(Vec<Row>),
    /// Statement without a result set (DDL, DML without RETURNING)
    Success,
}

impl QueryResult {
    /// Rows returned, empty for the success marker
    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Rows(rows) => rows,
            Self::Success => &[],
        }
    }

    pub fn is_success_marker(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Uniform record sequence: the rows, or a single success-marker record
    pub fn into_records(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Success => vec![success_marker()],
        }
    }
}

impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Rows(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
            Self::Success => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&success_marker())?;
                seq.end()
            }
        }
    }
}

fn success_marker() -> Row {
    let mut row = Row::new();
    row.insert(
        "message".to_string(),
        serde_json::Value::String(SUCCESS_MESSAGE.to_string()),
    );
    row
}
