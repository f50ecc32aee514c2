//! Schema-driven type coercion
//!
//! The remote speaks strings; callers work with typed records. Decoding
//! turns a wire row into typed values using the table's schema, resolving
//! dotted keys (`a.b.c`) into nested records by walking reference columns.
//! Encoding flattens typed values back into wire strings; writes are flat,
//! so the nested direction has no inverse.

use crate::schema::{SchemaCache, SchemaColumn, TableSchema};
use crate::status::Status;
use crate::transport::Transport;
use async_recursion::async_recursion;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use glidesync_core::{GlideError, Record, Result, Value, WireRow, guid};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bounded fan-out for batch row conversion.
pub const BATCH_CONCURRENCY: usize = 8;

/// Wire format for instants: UTC, seconds precision.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Display-style date format some responses carry (day first).
const DISPLAY_DATE_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Format an instant the way the wire expects, milliseconds dropped.
pub fn encode_date(instant: &DateTime<Utc>) -> String {
    instant.format(DATE_FORMAT).to_string()
}

/// Parse a wire date in either accepted input format.
pub fn decode_date(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    let parsed = NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, DISPLAY_DATE_FORMAT))
        .map_err(|_| GlideError::coercion(column, format!("invalid date: {raw:?}")))?;
    Ok(Utc.from_utc_datetime(&parsed))
}

/// Decode a batch of wire rows element-wise with bounded concurrency.
pub async fn decode_rows(
    cache: &SchemaCache,
    transport: &Transport,
    table: &str,
    rows: Vec<WireRow>,
) -> Result<Vec<Record>> {
    let schema = cache.get(table, transport).await?;
    stream::iter(rows)
        .map(|row| decode_with_schema(cache, transport, schema.clone(), row))
        .buffered(BATCH_CONCURRENCY)
        .try_collect()
        .await
}

/// Decode one wire row for `table`.
pub async fn decode_row(
    cache: &SchemaCache,
    transport: &Transport,
    table: &str,
    row: WireRow,
) -> Result<Record> {
    let schema = cache.get(table, transport).await?;
    decode_with_schema(cache, transport, schema, row).await
}

#[async_recursion]
async fn decode_with_schema(
    cache: &SchemaCache,
    transport: &Transport,
    schema: Arc<TableSchema>,
    row: WireRow,
) -> Result<Record> {
    let mut record = Record::new();
    let mut nested: BTreeMap<String, WireRow> = BTreeMap::new();

    for (key, raw) in row {
        if let Some((head, rest)) = key.split_once('.') {
            nested
                .entry(head.to_string())
                .or_default()
                .insert(rest.to_string(), raw);
        } else {
            record.insert(key.clone(), decode_scalar(schema.get(&key), &key, &raw)?);
        }
    }

    for (head, sub_row) in nested {
        let column = schema.get(&head).ok_or_else(|| {
            GlideError::coercion(&head, "dotted lookup through a column not in the schema")
        })?;
        let reference_table = column.reference_table.clone().ok_or_else(|| {
            GlideError::coercion(&head, "dotted lookup through a non-reference column")
        })?;
        let sub_schema = cache.get(&reference_table, transport).await?;
        let sub_record = decode_with_schema(cache, transport, sub_schema, sub_row).await?;
        record.insert(head, Value::Record(sub_record));
    }

    Ok(record)
}

fn decode_scalar(
    column: Option<&SchemaColumn>,
    name: &str,
    raw: &serde_json::Value,
) -> Result<Value> {
    let raw = match raw {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Null => return Ok(Value::Null),
        // Reference link objects come through untouched.
        serde_json::Value::Object(map) => {
            let mut nested = Record::new();
            for (key, value) in map {
                nested.insert(
                    key.clone(),
                    match value {
                        serde_json::Value::String(s) => Value::String(s.clone()),
                        other => Value::String(other.to_string()),
                    },
                );
            }
            return Ok(Value::Record(nested));
        }
        serde_json::Value::Bool(b) => return Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            return Ok(n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float))
                .unwrap_or(Value::Null));
        }
        serde_json::Value::Array(_) => {
            return Err(GlideError::coercion(name, "unexpected array value"));
        }
    };

    let Some(column) = column else {
        // Columns the schema does not know pass through as strings.
        return Ok(Value::String(raw.to_string()));
    };

    match column.internal_type.as_str() {
        // The remote displays booleans as true/false but stores them as
        // 1/0; both spellings round-trip.
        "boolean" => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            "" => Ok(Value::Null),
            other => Err(GlideError::coercion(name, format!("invalid boolean: {other:?}"))),
        },
        "integer" | "long" => {
            if raw.is_empty() {
                return Ok(Value::Null);
            }
            if let Ok(value) = raw.parse::<i64>() {
                return Ok(Value::Int(value));
            }
            // Choice-list integers may carry display strings; anything
            // else must parse base-10.
            if column.has_choice_list {
                Ok(Value::String(raw.to_string()))
            } else {
                Err(GlideError::coercion(name, format!("invalid integer: {raw:?}")))
            }
        }
        "float" | "decimal" => {
            if raw.is_empty() {
                return Ok(Value::Null);
            }
            match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(Value::Float(value)),
                _ => Err(GlideError::coercion(name, format!("invalid number: {raw:?}"))),
            }
        }
        "glide_date_time" => {
            if raw.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::DateTime(decode_date(name, raw)?))
            }
        }
        // Strings, references and every tag outside the closed set pass
        // through; references stay GUID strings on reads.
        _ => Ok(Value::String(raw.to_string())),
    }
}

/// Encode a batch of typed rows into wire rows.
pub fn encode_rows(
    schema: &TableSchema,
    rows: &[Record],
    status: &dyn Status,
) -> Result<Vec<WireRow>> {
    rows.iter().map(|row| encode_row(schema, row, status)).collect()
}

/// Encode one typed row into its flat wire form.
pub fn encode_row(schema: &TableSchema, record: &Record, status: &dyn Status) -> Result<WireRow> {
    let mut row = WireRow::new();
    for (name, value) in record {
        let encoded = match schema.get(name) {
            Some(column) => encode_value(column, name, value, status)?,
            None => match value {
                Value::Record(_) => {
                    return Err(GlideError::coercion(name, "cannot write a nested value"));
                }
                Value::Null => String::new(),
                Value::DateTime(instant) => encode_date(instant),
                other => other.to_string(),
            },
        };
        row.insert(name.clone(), serde_json::Value::String(encoded));
    }
    Ok(row)
}

fn encode_value(
    column: &SchemaColumn,
    name: &str,
    value: &Value,
    status: &dyn Status,
) -> Result<String> {
    match column.internal_type.as_str() {
        "boolean" => match value {
            Value::Bool(true) => Ok("1".to_string()),
            Value::Bool(false) | Value::Null => Ok("0".to_string()),
            Value::Int(0) => Ok("0".to_string()),
            Value::Int(1) => Ok("1".to_string()),
            Value::String(s) if s == "true" || s == "1" => Ok("1".to_string()),
            Value::String(s) if s == "false" || s == "0" || s.is_empty() => Ok("0".to_string()),
            other => Err(GlideError::coercion(name, format!("invalid boolean: {other}"))),
        },
        "integer" | "long" => match value {
            Value::Null => Ok(String::new()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Float(v) => Ok((v.round() as i64).to_string()),
            // Only choice-list columns may carry raw display strings.
            Value::String(s) if column.has_choice_list => Ok(s.clone()),
            other => Err(GlideError::coercion(name, format!("invalid integer: {other}"))),
        },
        "float" => match value.as_f64() {
            Some(v) => Ok(((v * 1e7).round() / 1e7).to_string()),
            None if value.is_null() => Ok(String::new()),
            None => Err(GlideError::coercion(name, format!("invalid number: {value}"))),
        },
        "decimal" => match value.as_f64() {
            Some(v) => Ok(format!("{v:.2}")),
            None if value.is_null() => Ok(String::new()),
            None => Err(GlideError::coercion(name, format!("invalid number: {value}"))),
        },
        "glide_date_time" => match value {
            Value::Null => Ok(String::new()),
            Value::DateTime(instant) => Ok(encode_date(instant)),
            Value::String(s) if s.is_empty() => Ok(String::new()),
            Value::String(s) => Ok(encode_date(&decode_date(name, s)?)),
            other => Err(GlideError::coercion(name, format!("invalid date: {other}"))),
        },
        "reference" | "glide_list" => match value {
            Value::Null => Ok(String::new()),
            Value::String(s) if s.is_empty() || guid::is_sys_id(s) => Ok(s.clone()),
            other => Err(GlideError::coercion(
                name,
                format!("reference must be a sys_id or empty, got {other}"),
            )),
        },
        // String kinds and anything outside the closed set stringify.
        _ => {
            let text = match value {
                Value::Null => String::new(),
                Value::Record(_) => {
                    return Err(GlideError::coercion(name, "cannot write a nested value"));
                }
                Value::DateTime(instant) => encode_date(instant),
                other => other.to_string(),
            };
            if let Some(max) = column.max_length {
                let max = max.max(0) as usize;
                if text.chars().count() > max {
                    status.warn(&format!(
                        "{name}: value truncated to {max} characters"
                    ));
                    return Ok(text.chars().take(max).collect());
                }
            }
            Ok(text)
        }
    }
}
