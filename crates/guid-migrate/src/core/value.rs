//! Typed SQL values.
//!
//! Portable files carry untyped JSON scalars; the column's [`ColumnType`]
//! decides how a scalar is interpreted on the way back into a database.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::schema::ColumnType;

/// Timestamp layout used in portable files.
const PORTABLE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with the type of the column it came from.
    Null(ColumnType),
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// The column type this value belongs to.
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => ColumnType::Bool,
            SqlValue::I32(_) => ColumnType::Int,
            SqlValue::I64(_) => ColumnType::BigInt,
            SqlValue::F64(_) => ColumnType::Float,
            SqlValue::Text(_) => ColumnType::Text,
            SqlValue::Uuid(_) => ColumnType::Uuid,
            SqlValue::DateTime(_) => ColumnType::Timestamp,
            SqlValue::Date(_) => ColumnType::Date,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret a portable JSON scalar as a value of `column_type`.
    pub fn from_portable(value: &JsonValue, column_type: ColumnType) -> Result<Self, String> {
        if value.is_null() {
            return Ok(SqlValue::Null(column_type));
        }

        let mismatch = || format!("expected {:?}, found {}", column_type, value);

        match column_type {
            ColumnType::Bool => value.as_bool().map(SqlValue::Bool).ok_or_else(mismatch),
            ColumnType::Int => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(SqlValue::I32)
                .ok_or_else(mismatch),
            ColumnType::BigInt => value.as_i64().map(SqlValue::I64).ok_or_else(mismatch),
            ColumnType::Float => value.as_f64().map(SqlValue::F64).ok_or_else(mismatch),
            ColumnType::Text => value
                .as_str()
                .map(|s| SqlValue::Text(s.to_string()))
                .ok_or_else(mismatch),
            ColumnType::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(SqlValue::Uuid)
                .ok_or_else(mismatch),
            ColumnType::Timestamp => value
                .as_str()
                .and_then(|s| s.parse::<NaiveDateTime>().ok())
                .map(SqlValue::DateTime)
                .ok_or_else(mismatch),
            ColumnType::Date => value
                .as_str()
                .and_then(|s| s.parse::<NaiveDate>().ok())
                .map(SqlValue::Date)
                .ok_or_else(mismatch),
        }
    }

    /// Convert to a portable JSON scalar.
    pub fn to_portable(&self) -> JsonValue {
        match self {
            SqlValue::Null(_) => JsonValue::Null,
            SqlValue::Bool(v) => JsonValue::Bool(*v),
            SqlValue::I32(v) => JsonValue::from(*v),
            SqlValue::I64(v) => JsonValue::from(*v),
            SqlValue::F64(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SqlValue::Text(v) => JsonValue::String(v.clone()),
            SqlValue::Uuid(v) => JsonValue::String(v.to_string()),
            SqlValue::DateTime(v) => {
                JsonValue::String(v.format(PORTABLE_TIMESTAMP_FORMAT).to_string())
            }
            SqlValue::Date(v) => JsonValue::String(v.format("%Y-%m-%d").to_string()),
        }
    }

    /// Render for PostgreSQL `COPY ... FROM STDIN (FORMAT TEXT)`.
    pub fn to_copy_text(&self) -> String {
        match self {
            SqlValue::Null(_) => "\\N".to_string(),
            SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
            SqlValue::I32(i) => i.to_string(),
            SqlValue::I64(i) => i.to_string(),
            SqlValue::F64(f) => f.to_string(),
            SqlValue::Text(s) => escape_copy_text(s),
            SqlValue::Uuid(u) => u.to_string(),
            SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        v.map(SqlValue::I64).unwrap_or(SqlValue::Null(ColumnType::BigInt))
    }
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_keeps_column_type() {
        let v = SqlValue::from_portable(&JsonValue::Null, ColumnType::Date).unwrap();
        assert_eq!(v, SqlValue::Null(ColumnType::Date));
        assert_eq!(v.column_type(), ColumnType::Date);
        assert!(v.is_null());
    }

    #[test]
    fn test_int_out_of_range_is_rejected() {
        let err = SqlValue::from_portable(&json!(5_000_000_000i64), ColumnType::Int).unwrap_err();
        assert!(err.contains("Int"));
        assert_eq!(
            SqlValue::from_portable(&json!(5_000_000_000i64), ColumnType::BigInt).unwrap(),
            SqlValue::I64(5_000_000_000)
        );
    }

    #[test]
    fn test_timestamp_portable_format() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(8, 30, 0, 250)
            .unwrap();
        let portable = SqlValue::DateTime(ts).to_portable();
        assert_eq!(portable, json!("2024-03-01T08:30:00.250"));
        assert_eq!(
            SqlValue::from_portable(&json!("2024-03-01T08:30:00"), ColumnType::Timestamp).unwrap(),
            SqlValue::DateTime(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_type_mismatch() {
        assert!(SqlValue::from_portable(&json!("yes"), ColumnType::Bool).is_err());
        assert!(SqlValue::from_portable(&json!("not-a-uuid"), ColumnType::Uuid).is_err());
        assert!(SqlValue::from_portable(&json!(1), ColumnType::Text).is_err());
    }

    #[test]
    fn test_copy_text_escaping() {
        let v = SqlValue::Text("a\tb\\c\nd".to_string());
        assert_eq!(v.to_copy_text(), "a\\tb\\\\c\\nd");
        assert_eq!(SqlValue::Null(ColumnType::Text).to_copy_text(), "\\N");
        assert_eq!(SqlValue::Bool(false).to_copy_text(), "f");
    }
}
