//! Helpers for reading typed records defensively

use glidesync_core::{Record, Value};

/// Field as display text; absent and null both read as empty.
pub(crate) fn text(row: &Record, field: &str) -> String {
    match row.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(value) => value.to_string(),
    }
}

/// Boolean field; accepts native bools and their wire spellings.
pub(crate) fn flag(row: &Record, field: &str) -> bool {
    match row.get(field) {
        Some(Value::Bool(value)) => *value,
        Some(Value::String(value)) => value == "true" || value == "1",
        _ => false,
    }
}

/// Integer field if present and numeric.
pub(crate) fn int(row: &Record, field: &str) -> Option<i64> {
    row.get(field).and_then(Value::as_i64)
}
