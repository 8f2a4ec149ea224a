//! Row value representations.
//!
//! Values decoded from the replication feed are carried as [`RowValue`], and a
//! row image is an ordered [`Row`] mapping column names to values. Column order
//! is preserved because it drives the order of `affected_columns` in
//! normalized events.

use base64::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// A single column value from a row image.
///
/// Equality is structural: two `Json` values are equal when their documents
/// are equal, and date/time variants compare by the instant they denote.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    /// SQL NULL
    Null,

    /// Boolean value (also produced from single-byte binary values)
    Bool(bool),

    /// Signed integer
    Int(i64),

    /// Unsigned integer
    UInt(u64),

    /// Floating point (FLOAT and DOUBLE)
    Double(f64),

    /// DECIMAL kept in its exact textual form
    Decimal(String),

    /// Character data
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// DATE
    Date(NaiveDate),

    /// DATETIME (no time zone)
    DateTime(NaiveDateTime),

    /// TIMESTAMP (UTC instant)
    Timestamp(DateTime<Utc>),

    /// TIME, formatted as `[-]HH:MM:SS[.ffffff]`
    Time(String),

    /// JSON document
    Json(serde_json::Value),
}

impl RowValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to get this value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Decimal(s) | Self::Time(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is a date or time value.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            Self::Date(_) | Self::DateTime(_) | Self::Timestamp(_) | Self::Time(_)
        )
    }

    /// Canonicalize a single-byte binary value to a boolean.
    ///
    /// `BIT(1)` columns arrive as one-byte buffers; any nonzero byte is `true`.
    pub fn canonicalize(self) -> Self {
        match self {
            Self::Bytes(bytes) if bytes.len() == 1 => Self::Bool(bytes[0] > 0),
            other => other,
        }
    }
}

impl Serialize for RowValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RowValue::Null => serializer.serialize_none(),
            RowValue::Bool(b) => serializer.serialize_bool(*b),
            RowValue::Int(i) => serializer.serialize_i64(*i),
            RowValue::UInt(u) => serializer.serialize_u64(*u),
            RowValue::Double(f) => serializer.serialize_f64(*f),
            RowValue::Decimal(s) | RowValue::Text(s) | RowValue::Time(s) => {
                serializer.serialize_str(s)
            }
            RowValue::Bytes(b) => serializer.serialize_str(&BASE64_STANDARD.encode(b)),
            RowValue::Date(d) => d.serialize(serializer),
            RowValue::DateTime(dt) => dt.serialize(serializer),
            RowValue::Timestamp(ts) => ts.serialize(serializer),
            RowValue::Json(v) => v.serialize(serializer),
        }
    }
}

impl From<bool> for RowValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for RowValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for RowValue {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<u64> for RowValue {
    fn from(u: u64) -> Self {
        Self::UInt(u)
    }
}

impl From<f64> for RowValue {
    fn from(f: f64) -> Self {
        Self::Double(f)
    }
}

impl From<&str> for RowValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RowValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for RowValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<NaiveDateTime> for RowValue {
    fn from(dt: NaiveDateTime) -> Self {
        Self::DateTime(dt)
    }
}

impl From<DateTime<Utc>> for RowValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

impl<T: Into<RowValue>> From<Option<T>> for RowValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(RowValue::Null)
    }
}

/// An ordered row image: column name → value, in table column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(IndexMap<String, RowValue>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append or replace a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<RowValue>) {
        self.0.insert(column.into(), value.into());
    }

    /// Builder-style variant of [`Row::insert`].
    pub fn with(mut self, column: impl Into<String>, value: impl Into<RowValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&RowValue> {
        self.0.get(column)
    }

    /// Column names in row order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RowValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonicalize every single-byte binary column to a boolean.
    pub fn canonicalize(self) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|(column, value)| (column, value.canonicalize()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<RowValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Row {
    type Item = (String, RowValue);
    type IntoIter = indexmap::map::IntoIter<String, RowValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
