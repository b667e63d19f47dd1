//! Conversions between model fields and libSQL values

use libsql::Value;
use serde_json::Value as Json;

use crate::error::{Error, Result};

/// Serialize an optional JSON document into a TEXT column
pub fn json_value(value: Option<&Json>) -> Result<Value> {
    Ok(match value {
        Some(json) => Value::Text(serde_json::to_string(json)?),
        None => Value::Null,
    })
}

/// Parse an optional TEXT column holding a JSON document
pub fn parse_json(raw: Option<String>) -> Result<Option<Json>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(Error::from)
}

pub fn opt_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

pub fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Read a non-negative counter column
pub fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Database(format!("column {column} out of range: {value}")))
}
