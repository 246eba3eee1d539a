//! Dynamically typed column values.
//!
//! Everything that crosses the boundary between the query compiler, the
//! execution adapter and the model state machine is a [`Value`]. Rows come
//! back as [`Record`]s, an ordered column-name map, so that the compiled
//! column order of INSERT and UPDATE statements is stable.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::TabulaError;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    DateTime(DateTime<Utc>),
}

/// One row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::DateTime(_) => "datetime",
        }
    }

    /// Integer view of the value. Text is parsed, floats must be integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            Value::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Text(v) => parse_bool(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Point-in-time view. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`,
    /// plain dates and unix seconds.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(v) => Some(*v),
            Value::Int(v) => DateTime::from_timestamp(*v, 0),
            Value::Text(v) => parse_datetime(v.trim()),
            _ => None,
        }
    }

    /// Converts byte payloads into text. Invalid UTF-8 is replaced, not rejected.
    pub fn normalize_bytes(self) -> Value {
        match self {
            Value::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Value::Text(text),
                Err(err) => Value::Text(String::from_utf8_lossy(err.as_bytes()).into_owned()),
            },
            other => other,
        }
    }

    /// Rendering used by the debug log of compiled statements.
    pub(crate) fn to_log_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_owned(),
            Value::Text(v) => format!("'{v}'"),
            Value::Bytes(v) => format!("<{} bytes>", v.len()),
            other => other.to_string(),
        }
    }

    /// JSON rendering. Datetimes become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(v) => serde_json::Value::String(v.clone()),
            Value::Bytes(v) => serde_json::Value::String(String::from_utf8_lossy(v).into_owned()),
            Value::Uuid(v) => serde_json::Value::String(v.to_string()),
            Value::DateTime(v) => serde_json::Value::String(v.to_rfc3339()),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => f.write_str(&String::from_utf8_lossy(v)),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::DateTime(v) => f.write_str(&v.to_rfc3339()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
            Value::Uuid(v) => serializer.collect_str(v),
            Value::DateTime(v) => serializer.serialize_str(&v.to_rfc3339()),
        }
    }
}

macro_rules! int_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v.and_utc())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::Text(s),
            nested => Value::Text(nested.to_string()),
        }
    }
}

fn mismatch(expected: &str, value: &Value) -> TabulaError {
    TabulaError::Validation(format!(
        "expected {expected}, found {} value `{value}`",
        value.type_name()
    ))
}

// Typed extraction used by entity field setters.

impl TryFrom<Value> for String {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Err(mismatch("text", &value)),
            Value::Text(v) => Ok(v),
            other => Ok(other.to_string()),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| mismatch("int", &value))
    }
}

impl TryFrom<Value> for i32 {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| mismatch("32-bit int", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| mismatch("float", &value))
    }
}

impl TryFrom<Value> for bool {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| mismatch("bool", &value))
    }
}

impl TryFrom<Value> for DateTime<Utc> {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_datetime().ok_or_else(|| mismatch("datetime", &value))
    }
}

impl TryFrom<Value> for Uuid {
    type Error = TabulaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Uuid(v) => Ok(*v),
            Value::Text(v) => Uuid::parse_str(v.trim()).map_err(|_| mismatch("uuid", &value)),
            _ => Err(mismatch("uuid", &value)),
        }
    }
}

macro_rules! optional_try_from {
    ($($ty:ty),*) => {
        $(impl TryFrom<Value> for Option<$ty> {
            type Error = TabulaError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    Value::Null => Ok(None),
                    other => <$ty>::try_from(other).map(Some),
                }
            }
        })*
    };
}

optional_try_from!(String, i64, i32, f64, bool, DateTime<Utc>, Uuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_views_parse_text() {
        assert_eq!(Value::from("42").as_i64(), Some(42));
        assert_eq!(Value::from(" 2.5 ").as_f64(), Some(2.5));
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float(3.5).as_i64(), None);
        assert_eq!(Value::Null.as_i64(), None);
    }

    #[test]
    fn bool_view_accepts_common_spellings() {
        assert_eq!(Value::from("yes").as_bool(), Some(true));
        assert_eq!(Value::from("0").as_bool(), Some(false));
        assert_eq!(Value::from("maybe").as_bool(), None);
        assert_eq!(Value::Int(2).as_bool(), Some(true));
    }

    #[test]
    fn datetime_view_accepts_sql_and_rfc3339() {
        let a = Value::from("2024-03-01 10:20:30").as_datetime();
        let b = Value::from("2024-03-01T10:20:30Z").as_datetime();
        assert!(a.is_some());
        assert_eq!(a, b);
        assert!(Value::from("2024-03-01").as_datetime().is_some());
        assert!(Value::from("not a date").as_datetime().is_none());
    }

    #[test]
    fn bytes_normalize_to_text() {
        assert_eq!(
            Value::Bytes(b"hello".to_vec()).normalize_bytes(),
            Value::Text("hello".to_owned())
        );
        assert_eq!(Value::Int(1).normalize_bytes(), Value::Int(1));
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_owned()));
    }

    #[test]
    fn serializes_as_plain_json() {
        let mut record = Record::new();
        record.insert("name".to_owned(), Value::from("Ada"));
        record.insert("age".to_owned(), Value::from(36));
        record.insert("bio".to_owned(), Value::Null);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"age":36,"bio":null,"name":"Ada"}"#);
    }

    #[test]
    fn typed_extraction_reports_mismatch() {
        let err = i64::try_from(Value::from("abc")).unwrap_err();
        assert!(err.to_string().contains("expected int"));
        assert_eq!(Option::<i64>::try_from(Value::Null).unwrap(), None);
        assert_eq!(String::try_from(Value::Int(7)).unwrap(), "7");
    }
}
