//! PostgreSQL row to JSON conversion.
//!
//! `ExecuteResult.rows` (see [`crate::manager`]) is JSON because the agent
//! consuming it speaks JSON, not Rust types. This module dispatches on the
//! wire type name the same way the teacher's row-to-Python conversion does,
//! just targeting `serde_json::Value` instead of a Python object.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, Row, TypeInfo};
use uuid::Uuid;

use dbgate_common::{GatewayError, Result};

/// Binds one JSON-shaped parameter onto a query's argument list.
///
/// Scalars bind to their natural wire type; objects and arrays bind as
/// JSONB, which lets a caller pass structured parameters without a
/// dedicated enum for every shape a statement might need.
pub fn bind_param(arguments: &mut PgArguments, value: &Value) -> Result<()> {
    let result = match value {
        Value::Null => arguments.add(Option::<i32>::None),
        Value::Bool(b) => arguments.add(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                arguments.add(i)
            } else if let Some(f) = n.as_f64() {
                arguments.add(f)
            } else {
                arguments.add(n.to_string())
            }
        }
        Value::String(s) => arguments.add(s.clone()),
        Value::Array(_) | Value::Object(_) => arguments.add(value.clone()),
    };
    result.map_err(|e| GatewayError::InvalidArgument(format!("failed to bind parameter: {e}")))
}

/// Converts one row into an ordered JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();
        let value = column_to_json(row, idx, type_name, &name)?;
        out.insert(name, value);
    }
    Ok(out)
}

fn extraction_error(type_name: &str, column: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Internal(format!(
        "failed to extract {type_name} from column '{column}': {err}"
    ))
}

fn column_to_json(row: &PgRow, idx: usize, type_name: &str, column: &str) -> Result<Value> {
    let value = match type_name {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "INT4" | "INTEGER" | "INT" => row
            .try_get::<Option<i32>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v as f64)),
        "FLOAT8" | "DOUBLE PRECISION" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "VARCHAR" | "TEXT" | "CHAR" | "BPCHAR" | "NAME" => row
            .try_get::<Option<String>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(Value::from),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|bytes| Value::String(format!("\\x{}", hex_encode(&bytes)))),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v.to_string())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v.to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v.to_string())),
        "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?
            .map(|v| Value::from(v.to_rfc3339())),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .map_err(|e| extraction_error(type_name, column, e))?,
        "NUMERIC" | "DECIMAL" => match row.try_get::<Option<Decimal>, _>(idx) {
            Ok(opt) => opt.map(|v| Value::from(v.to_string())),
            Err(_) => row
                .try_get::<Option<String>, _>(idx)
                .map_err(|e| extraction_error(type_name, column, e))?
                .map(Value::from),
        },
        unknown => {
            tracing::warn!(
                column,
                pg_type = unknown,
                "unrecognized PostgreSQL type, falling back to string extraction"
            );
            row.try_get::<Option<String>, _>(idx)
                .map_err(|e| extraction_error(unknown, column, e))?
                .map(Value::from)
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
        assert_eq!(hex_encode(&[]), "");
    }
}
