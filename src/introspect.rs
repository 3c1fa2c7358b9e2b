//! Live schema introspection
//!
//! Engines read raw catalog rows (tables, columns, key constraints) scoped
//! to one schema and hand them to [`assemble`], which groups them per table
//! and orders tables so that referenced tables come before the tables that
//! reference them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::connection::ConnectionHandle;
use crate::error::DatabaseError;
use crate::types::{ColumnDescriptor, ForeignKeyDescriptor, SchemaDescription, TableDescription};

/// One column as read from the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// One foreign key column pair as read from the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogForeignKey {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Raw catalog contents of one schema
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Base tables of the schema
    pub tables: Vec<String>,
    /// Columns in ordinal order per table
    pub columns: Vec<CatalogColumn>,
    pub foreign_keys: Vec<CatalogForeignKey>,
}

/// Describe every table under `schema` on `handle`
///
/// A `None` or blank schema selects the engine default (`current_schema()`
/// on PostgreSQL, `DATABASE()` on MySQL). A schema that does not exist is
/// [`DatabaseError::SchemaNotFound`]; there is no fallback.
pub async fn describe(
    handle: &ConnectionHandle,
    schema: Option<&str>,
) -> Result<SchemaDescription, DatabaseError> {
    let schema = schema.map(str::trim).filter(|s| !s.is_empty());
    let description = handle.engine().describe(schema).await?;
    log::debug!(
        "Described {} tables in schema {}",
        description.len(),
        schema.unwrap_or("<default>")
    );
    Ok(description)
}

/// Group catalog rows per table and order tables by dependency
///
/// Columns and foreign keys of relations not listed in `catalog.tables`
/// (views, other schemas) are dropped.
pub fn assemble(catalog: Catalog) -> SchemaDescription {
    let mut tables: BTreeMap<String, TableDescription> = catalog
        .tables
        .into_iter()
        .map(|name| {
            let table = TableDescription {
                name: name.clone(),
                columns: Vec::new(),
                foreign_keys: Vec::new(),
            };
            (name, table)
        })
        .collect();

    for column in catalog.columns {
        if let Some(table) = tables.get_mut(&column.table) {
            table.columns.push(ColumnDescriptor {
                name: column.name,
                data_type: column.data_type,
                nullable: column.nullable,
                primary_key: column.primary_key,
            });
        }
    }

    for fk in catalog.foreign_keys {
        if let Some(table) = tables.get_mut(&fk.table) {
            table.foreign_keys.push(ForeignKeyDescriptor {
                column: fk.column,
                references: fk.referenced_table,
                referenced_column: fk.referenced_column,
            });
        }
    }

    let order = dependency_order(&tables);
    let tables = order
        .into_iter()
        .filter_map(|name| tables.remove(&name))
        .collect();

    SchemaDescription { tables }
}

/// Kahn's algorithm with name order among ready tables
///
/// Self references and references to unknown tables are ignored. Tables
/// caught in a cycle are appended in name order.
fn dependency_order(tables: &BTreeMap<String, TableDescription>) -> Vec<String> {
    let mut pending: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, BTreeSet<&str>> = HashMap::new();

    for (name, table) in tables {
        let parents: BTreeSet<&str> = table
            .foreign_keys
            .iter()
            .map(|fk| fk.references.as_str())
            .filter(|parent| *parent != name.as_str() && tables.contains_key(*parent))
            .collect();
        pending.insert(name.as_str(), parents.len());
        for parent in parents {
            dependents.entry(parent).or_default().insert(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(tables.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        pending.remove(name);
        for child in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    let mut cyclic: Vec<&str> = pending.into_keys().collect();
    cyclic.sort_unstable();
    order.extend(cyclic.into_iter().map(str::to_string));
    order
}

impl SchemaDescription {
    /// Render the structure as compact text for an LLM prompt
    ///
    /// One `Table: <name>, Columns: <col> (<type>), ...` line per table,
    /// followed by `  FK: <col> -> <table>.<col>` lines for its foreign keys.
    pub fn to_prompt_context(&self) -> String {
        let mut lines = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{} ({})", c.name, c.data_type))
                .collect();
            lines.push(format!("Table: {}, Columns: {}", table.name, columns.join(", ")));
            for fk in &table.foreign_keys {
                lines.push(format!(
                    "  FK: {} -> {}.{}",
                    fk.column, fk.references, fk.referenced_column
                ));
            }
        }
        lines.join("\n")
    }
}
