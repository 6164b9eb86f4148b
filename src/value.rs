//! Scalar values and rows exchanged with the store
//!
//! `Value` is the single currency between entity accessors and SQLite:
//! accessors flatten fields into values on write and receive values back on
//! inflation. A `Row` is an ordered column-name to value mapping.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

/// A scalar stored in, or read from, a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Get the storage class name of the value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Decode into a concrete field type.
    pub fn decode<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::Conversion {
            expected,
            found: self.type_name(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => {
                let text = std::str::from_utf8(t).map_err(|e| FromSqlError::Other(Box::new(e)))?;
                Value::Text(text.to_string())
            }
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

// ========== Into Value ==========

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

/// Dates are stored as milliseconds since the Unix epoch.
impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Integer(v.timestamp_millis())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ========== From Value ==========

/// Conversion from a stored value back into a field type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i),
            other => Err(other.mismatch("integer")),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => i32::try_from(i).map_err(|_| Error::Conversion {
                expected: "i32",
                found: "out-of-range integer",
            }),
            other => Err(other.mismatch("i32")),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Real(r) => Ok(r),
            Value::Integer(i) => Ok(i as f64),
            other => Err(other.mismatch("real")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i != 0),
            other => Err(other.mismatch("boolean")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(other.mismatch("text")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Blob(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(other.mismatch("blob")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(millis) => {
                DateTime::from_timestamp_millis(millis).ok_or(Error::Conversion {
                    expected: "date",
                    found: "out-of-range integer",
                })
            }
            other => Err(other.mismatch("date")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ========== Row ==========

/// An ordered mapping from column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Row::insert`]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Set a column, replacing any previous value under the same name
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Capture the current row of a rusqlite result set
    pub fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let stmt: &rusqlite::Statement<'_> = row.as_ref();
        let count = stmt.column_count();
        let mut columns = Vec::with_capacity(count);
        for i in 0..count {
            let name = stmt.column_name(i)?.to_string();
            columns.push((name, row.get::<_, Value>(i)?));
        }
        Ok(Self { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bool_is_stored_as_integer() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert!(Value::Integer(7).decode::<bool>().unwrap());
        assert!(!Value::Integer(0).decode::<bool>().unwrap());
    }

    #[test]
    fn test_date_is_stored_as_millis() {
        let date = Utc.with_ymd_and_hms(2016, 8, 23, 12, 0, 0).unwrap();
        let value = Value::from(date);
        assert_eq!(value, Value::Integer(date.timestamp_millis()));
        assert_eq!(value.decode::<DateTime<Utc>>().unwrap(), date);
    }

    #[test]
    fn test_option_maps_null() {
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::Null.decode::<Option<i64>>().unwrap(), None);
        assert_eq!(Value::Integer(3).decode::<Option<i64>>().unwrap(), Some(3));
    }

    #[test]
    fn test_mismatch_reports_both_types() {
        let err = Value::Text("x".into()).decode::<i64>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("text"));
        assert!(msg.contains("integer"));
    }

    #[test]
    fn test_row_insert_replaces() {
        let mut row = Row::new().with("title", "a").with("pinned", true);
        row.insert("title", "b");
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("title"), Some(&Value::Text("b".into())));
        assert_eq!(row.names().collect::<Vec<_>>(), vec!["title", "pinned"]);
    }

    #[test]
    fn test_row_from_sql() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let row = conn
            .query_row("SELECT 1 AS a, 'x' AS b, NULL AS c", [], Row::from_sql)
            .unwrap();
        assert_eq!(row.get("a"), Some(&Value::Integer(1)));
        assert_eq!(row.get("b"), Some(&Value::Text("x".into())));
        assert_eq!(row.get("c"), Some(&Value::Null));
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT CAST(X'FF' AS TEXT) AS t", [], Row::from_sql)
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(..)));
    }
}
