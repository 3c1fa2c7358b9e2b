//! Row to JSON conversion for SQL results
//!
//! Converts driver rows into [`Row`] maps keyed by column name, in
//! select-list order. Values are dispatched on the column's type name:
//!
//! - integers and floats become JSON numbers
//! - DECIMAL/NUMERIC become JSON numbers (f64), or strings when not
//!   representable; PostgreSQL `NaN` and infinities become strings
//! - temporal types become ISO-8601 strings
//! - UUID becomes its hyphenated string
//! - JSON/JSONB are embedded as JSON
//! - binary types become base64 strings
//!
//! Types without a dedicated mapping are read as text only when the value
//! arrived text-encoded (or is a PostgreSQL enum, whose binary form is its
//! label); otherwise the column fails with a hint to cast it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde_json::{Number, Value};
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

#[cfg(feature = "postgres")]
use sqlx::postgres::{PgTypeKind, PgValueFormat};

use crate::error::DatabaseError;
use crate::types::Row;

/// JSON number for a float; NaN and infinities become strings
fn float(v: f64) -> Value {
    Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

fn decimal(d: BigDecimal) -> Value {
    match d.to_f64().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => Value::String(d.to_string()),
    }
}

fn binary(bytes: Vec<u8>) -> Value {
    Value::String(BASE64.encode(bytes))
}

fn extraction_error(name: &str, type_name: &str, err: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::QueryError(format!(
        "Failed to extract column '{}' as {}: {}",
        name, type_name, err
    ))
}

fn unsupported(name: &str, type_name: &str) -> DatabaseError {
    DatabaseError::QueryError(format!(
        "Unsupported column type '{}' for column '{}'. \
         Consider casting this column in your query: CAST({} AS TEXT)",
        type_name, name, name
    ))
}

/// Read column `index` as `T` and map it, keeping NULL as JSON null
fn get<'r, R, T>(
    row: &'r R,
    index: usize,
    name: &str,
    type_name: &str,
    map: impl FnOnce(T) -> Value,
) -> Result<Value, DatabaseError>
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, _>(index) {
        Ok(Some(v)) => Ok(map(v)),
        Ok(None) => Ok(Value::Null),
        Err(e) => Err(extraction_error(name, type_name, e)),
    }
}

/// Column is NULL regardless of its type
fn is_null<R>(row: &R, index: usize) -> bool
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(index).map(|v| v.is_null()).unwrap_or(false)
}

/// Convert a PostgreSQL row
#[cfg(feature = "postgres")]
pub fn pg_row_to_json(row: &sqlx::postgres::PgRow) -> Result<Row, DatabaseError> {
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use sqlx::postgres::types::{Oid, PgInterval, PgTimeTz};
    use sqlx::postgres::PgValueRef;

    let mut out = Row::new();

    for column in row.columns() {
        let i = column.ordinal();
        let name = column.name();
        let type_name = column.type_info().name();

        let value = if is_null(row, i) {
            Value::Null
        } else {
            match type_name {
                "BOOL" => get(row, i, name, type_name, Value::Bool)?,
                "INT2" => get(row, i, name, type_name, |v: i16| Value::from(v))?,
                "INT4" => get(row, i, name, type_name, |v: i32| Value::from(v))?,
                "INT8" => get(row, i, name, type_name, |v: i64| Value::from(v))?,
                "OID" => get(row, i, name, type_name, |v: Oid| Value::from(v.0))?,
                "FLOAT4" => get(row, i, name, type_name, |v: f32| float(f64::from(v)))?,
                "FLOAT8" => get(row, i, name, type_name, float)?,
                "NUMERIC" => {
                    let raw: PgValueRef<'_> = row
                        .try_get_raw(i)
                        .map_err(|e| extraction_error(name, type_name, e))?;
                    let special = match raw.format() {
                        PgValueFormat::Binary => raw.as_bytes().ok().and_then(pg_numeric_special),
                        PgValueFormat::Text => raw.as_str().ok().and_then(|s| match s {
                            "NaN" => Some("NaN"),
                            "Infinity" => Some("Infinity"),
                            "-Infinity" => Some("-Infinity"),
                            _ => None,
                        }),
                    };
                    match special {
                        Some(label) => Value::String(label.to_string()),
                        None => get(row, i, name, type_name, decimal)?,
                    }
                }
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
                    get(row, i, name, type_name, Value::String)?
                }
                "UUID" => get(row, i, name, type_name, |v: uuid::Uuid| {
                    Value::String(v.to_string())
                })?,
                "JSON" | "JSONB" => get(row, i, name, type_name, |v: Value| v)?,
                "BYTEA" => get(row, i, name, type_name, binary)?,
                "DATE" => get(row, i, name, type_name, |v: NaiveDate| {
                    Value::String(v.to_string())
                })?,
                "TIME" => get(row, i, name, type_name, |v: NaiveTime| {
                    Value::String(v.to_string())
                })?,
                "TIMETZ" => get(row, i, name, type_name, |v: PgTimeTz<NaiveTime, FixedOffset>| {
                    Value::String(format!("{}{}", v.time, v.offset))
                })?,
                "TIMESTAMP" => get(row, i, name, type_name, |v: NaiveDateTime| {
                    Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                })?,
                "TIMESTAMPTZ" => get(row, i, name, type_name, |v: DateTime<Utc>| {
                    Value::String(v.to_rfc3339())
                })?,
                "INTERVAL" => get(row, i, name, type_name, |v: PgInterval| {
                    Value::String(iso_interval(&v))
                })?,
                "INT2[]" => get(row, i, name, type_name, |v: Vec<i16>| Value::from(v))?,
                "INT4[]" => get(row, i, name, type_name, |v: Vec<i32>| Value::from(v))?,
                "INT8[]" => get(row, i, name, type_name, |v: Vec<i64>| Value::from(v))?,
                "FLOAT8[]" => get(row, i, name, type_name, |v: Vec<f64>| {
                    Value::Array(v.into_iter().map(float).collect())
                })?,
                "BOOL[]" => get(row, i, name, type_name, |v: Vec<bool>| Value::from(v))?,
                "TEXT[]" | "VARCHAR[]" => get(row, i, name, type_name, |v: Vec<String>| {
                    Value::from(v)
                })?,
                _ => {
                    let format = row
                        .try_get_raw(i)
                        .map_err(|e| extraction_error(name, type_name, e))?
                        .format();
                    if !pg_text_fallback(format, column.type_info().kind()) {
                        return Err(unsupported(name, type_name));
                    }
                    match row.try_get_unchecked::<String, _>(i) {
                        Ok(s) => Value::String(s),
                        Err(_) => return Err(unsupported(name, type_name)),
                    }
                }
            }
        };

        out.insert(name.to_string(), value);
    }

    Ok(out)
}

/// Whether an unmapped column can be read as a string
///
/// Binary-encoded values of most types (inet, ranges, arrays of unmapped
/// element types) are not text; only enums carry their label as bytes.
#[cfg(feature = "postgres")]
fn pg_text_fallback(format: PgValueFormat, kind: &PgTypeKind) -> bool {
    matches!(format, PgValueFormat::Text) || matches!(kind, PgTypeKind::Enum(_))
}

/// `NaN` / `Infinity` / `-Infinity` from the sign word of a binary NUMERIC
///
/// Header layout: ndigits, weight, sign, dscale (each 2 bytes, big endian).
#[cfg(feature = "postgres")]
fn pg_numeric_special(bytes: &[u8]) -> Option<&'static str> {
    let sign = u16::from_be_bytes([*bytes.get(4)?, *bytes.get(5)?]);
    match sign {
        0xC000 => Some("NaN"),
        0xD000 => Some("Infinity"),
        0xF000 => Some("-Infinity"),
        _ => None,
    }
}

/// ISO-8601 duration, e.g. `P1Y2M3DT4H5M6.5S`
#[cfg(feature = "postgres")]
fn iso_interval(v: &sqlx::postgres::types::PgInterval) -> String {
    let mut out = String::from("P");
    let (years, months) = (v.months / 12, v.months % 12);
    if years != 0 {
        out.push_str(&format!("{}Y", years));
    }
    if months != 0 {
        out.push_str(&format!("{}M", months));
    }
    if v.days != 0 {
        out.push_str(&format!("{}D", v.days));
    }
    if v.microseconds != 0 {
        let hours = v.microseconds / 3_600_000_000;
        let minutes = (v.microseconds % 3_600_000_000) / 60_000_000;
        let micros = v.microseconds % 60_000_000;
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if micros != 0 {
            let seconds = micros as f64 / 1_000_000.0;
            out.push_str(&format!("{}S", seconds));
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    out
}

/// Convert a MySQL row
#[cfg(feature = "mysql")]
pub fn mysql_row_to_json(row: &sqlx::mysql::MySqlRow) -> Result<Row, DatabaseError> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let mut out = Row::new();

    for column in row.columns() {
        let i = column.ordinal();
        let name = column.name();
        let type_name = column.type_info().name();

        let value = if is_null(row, i) {
            Value::Null
        } else {
            match type_name {
                "BOOLEAN" => get(row, i, name, type_name, Value::Bool)?,
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                    get(row, i, name, type_name, |v: i64| Value::from(v))?
                }
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED"
                | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
                    get(row, i, name, type_name, |v: u64| Value::from(v))?
                }
                "YEAR" => match row.try_get_unchecked::<u16, _>(i) {
                    Ok(v) => Value::from(v),
                    Err(e) => return Err(extraction_error(name, type_name, e)),
                },
                "FLOAT" => get(row, i, name, type_name, |v: f32| float(f64::from(v)))?,
                "DOUBLE" => get(row, i, name, type_name, float)?,
                "DECIMAL" => get(row, i, name, type_name, decimal)?,
                "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" => {
                    get(row, i, name, type_name, Value::String)?
                }
                "ENUM" | "SET" => match row.try_get_unchecked::<String, _>(i) {
                    Ok(s) => Value::String(s),
                    Err(e) => return Err(extraction_error(name, type_name, e)),
                },
                "JSON" => get(row, i, name, type_name, |v: Value| v)?,
                "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                    get(row, i, name, type_name, binary)?
                }
                "BIT" | "GEOMETRY" => match row.try_get_unchecked::<Vec<u8>, _>(i) {
                    Ok(bytes) => binary(bytes),
                    Err(e) => return Err(extraction_error(name, type_name, e)),
                },
                "DATE" => get(row, i, name, type_name, |v: NaiveDate| {
                    Value::String(v.to_string())
                })?,
                "TIME" => get(row, i, name, type_name, |v: NaiveTime| {
                    Value::String(v.to_string())
                })?,
                "DATETIME" => get(row, i, name, type_name, |v: NaiveDateTime| {
                    Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                })?,
                "TIMESTAMP" => get(row, i, name, type_name, |v: DateTime<Utc>| {
                    Value::String(v.to_rfc3339())
                })?,
                _ => match row.try_get_unchecked::<String, _>(i) {
                    Ok(s) => Value::String(s),
                    Err(_) => match row.try_get_unchecked::<Vec<u8>, _>(i) {
                        Ok(bytes) => binary(bytes),
                        Err(_) => return Err(unsupported(name, type_name)),
                    },
                },
            }
        };

        out.insert(name.to_string(), value);
    }

    Ok(out)
}
