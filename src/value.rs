//! Typed column values and result rows.
//!
//! Values mirror the sqlite storage classes plus a [`Value::Json`] case:
//! a text value that parses as JSON is replaced by its parsed structure
//! everywhere the engine handles rows (snapshot storage, trigger predicate
//! inputs, emitted results and diff comparison).

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rusqlite::types::{ToSqlOutput, ValueRef};

/// A single column value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// A text column whose content decoded as valid JSON.
    Json(serde_json::Value),
}

/// One result or snapshot row: column name to value.
pub type Row = BTreeMap<String, Value>;

impl Value {
    /// Build a value from text, applying the JSON affinity rule.
    pub fn from_text(text: String) -> Value {
        match serde_json::from_str(&text) {
            Ok(parsed) => Value::Json(parsed),
            Err(_) => Value::Text(text),
        }
    }

    /// Convert a sqlite column reference, applying the JSON affinity rule
    /// to text values.
    pub(crate) fn from_sql_ref(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::from_text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// Structural equality. `Real` compares by bit pattern so the impl can be
/// total; JSON numbers cannot be NaN, so `Json` delegates to `serde_json`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Integer(i) => {
                state.write_u8(1);
                i.hash(state);
            }
            Value::Real(f) => {
                state.write_u8(2);
                f.to_bits().hash(state);
            }
            Value::Text(t) => {
                state.write_u8(3);
                t.hash(state);
            }
            Value::Blob(b) => {
                state.write_u8(4);
                b.hash(state);
            }
            Value::Json(j) => {
                state.write_u8(5);
                // serde_json values are not hashable; the serialized form is
                // stable for a given value within one process.
                j.to_string().hash(state);
            }
        }
    }
}

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Json(j) => ToSqlOutput::Owned(rusqlite::types::Value::Text(j.to_string())),
        })
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}
