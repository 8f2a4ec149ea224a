//! MySQL binlog values → [`RowValue`]
//!
//! Row images in the binlog carry mysql `Value`s (or JSONB documents) plus the
//! column type and flags from the table map. This module maps them onto the
//! `RowValue` model used by the normalizer.

use binlog_core::RowValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::Value;
use thiserror::Error;

/// Error during MySQL value conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Type mismatch: expected {expected}, got {actual:?}")]
    TypeMismatch { expected: String, actual: Value },
    #[error("Invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid date/time value")]
    InvalidDateTime,
    #[error("Invalid JSON document: {0}")]
    InvalidJson(String),
    #[error("Partial JSON updates are not supported")]
    JsonDiff,
}

/// Convert a binlog row value.
pub fn binlog_value_to_row_value(
    value: BinlogValue<'_>,
    column_type: ColumnType,
    column_flags: ColumnFlags,
) -> Result<RowValue, ConversionError> {
    match value {
        BinlogValue::Value(value) => mysql_value_to_row_value(value, column_type, column_flags),
        BinlogValue::Jsonb(jsonb) => serde_json::Value::try_from(jsonb)
            .map(RowValue::Json)
            .map_err(|e| ConversionError::InvalidJson(e.to_string())),
        BinlogValue::JsonDiff(_) => Err(ConversionError::JsonDiff),
    }
}

/// Convert a plain mysql value given its column type and flags.
pub fn mysql_value_to_row_value(
    value: Value,
    column_type: ColumnType,
    column_flags: ColumnFlags,
) -> Result<RowValue, ConversionError> {
    use ColumnType::*;

    if matches!(value, Value::NULL) {
        return Ok(RowValue::Null);
    }

    match column_type {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG
        | MYSQL_TYPE_LONGLONG | MYSQL_TYPE_YEAR => match value {
            Value::UInt(u) => Ok(RowValue::UInt(u)),
            other => Ok(RowValue::Int(extract_int(&other)?)),
        },

        MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE => Ok(RowValue::Double(extract_float(&value)?)),

        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
            Ok(RowValue::Decimal(extract_string(&value)?))
        }

        MYSQL_TYPE_BIT | MYSQL_TYPE_GEOMETRY => Ok(RowValue::Bytes(extract_bytes(&value)?)),

        MYSQL_TYPE_STRING
        | MYSQL_TYPE_VAR_STRING
        | MYSQL_TYPE_VARCHAR
        | MYSQL_TYPE_TINY_BLOB
        | MYSQL_TYPE_MEDIUM_BLOB
        | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_LONG_BLOB => match value {
            Value::Bytes(bytes) => {
                if column_flags.contains(ColumnFlags::BINARY_FLAG) {
                    Ok(RowValue::Bytes(bytes))
                } else {
                    // Charset metadata may be missing from the table map;
                    // fall back to bytes for anything that is not UTF-8.
                    match String::from_utf8(bytes) {
                        Ok(s) => Ok(RowValue::Text(s)),
                        Err(e) => Ok(RowValue::Bytes(e.into_bytes())),
                    }
                }
            }
            // ENUM/SET arrive as their numeric index
            Value::Int(i) => Ok(RowValue::Int(i)),
            Value::UInt(u) => Ok(RowValue::UInt(u)),
            other => Ok(RowValue::Text(extract_string(&other)?)),
        },

        MYSQL_TYPE_ENUM | MYSQL_TYPE_SET => match value {
            Value::Int(i) => Ok(RowValue::Int(i)),
            Value::UInt(u) => Ok(RowValue::UInt(u)),
            other => Ok(RowValue::Text(extract_string(&other)?)),
        },

        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => match extract_date(&value) {
            Ok(date) => Ok(RowValue::Date(date)),
            Err(ConversionError::InvalidDateTime) => Ok(RowValue::Text(date_text(&value, false)?)),
            Err(e) => Err(e),
        },

        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => Ok(RowValue::Time(extract_time(&value)?)),

        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 => match extract_datetime(&value) {
            Ok(datetime) => Ok(RowValue::DateTime(datetime)),
            Err(ConversionError::InvalidDateTime) => Ok(RowValue::Text(date_text(&value, true)?)),
            Err(e) => Err(e),
        },

        MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIMESTAMP2 => {
            Ok(RowValue::Timestamp(extract_timestamp(&value)?))
        }

        MYSQL_TYPE_JSON => {
            let s = extract_string(&value)?;
            match serde_json::from_str::<serde_json::Value>(&s) {
                Ok(json) => Ok(RowValue::Json(json)),
                Err(_) => Ok(RowValue::Text(s)),
            }
        }

        _ => Ok(fallback(value)),
    }
}

/// Best-effort mapping for column types without a dedicated rule.
fn fallback(value: Value) -> RowValue {
    match value {
        Value::NULL => RowValue::Null,
        Value::Int(i) => RowValue::Int(i),
        Value::UInt(u) => RowValue::UInt(u),
        Value::Float(f) => RowValue::Double(f as f64),
        Value::Double(d) => RowValue::Double(d),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => RowValue::Text(s),
            Err(e) => RowValue::Bytes(e.into_bytes()),
        },
        Value::Date(..) => match extract_datetime(&value) {
            Ok(dt) => RowValue::DateTime(dt),
            Err(_) => date_text(&value, true).map_or(RowValue::Null, RowValue::Text),
        },
        Value::Time(..) => match extract_time(&value) {
            Ok(t) => RowValue::Time(t),
            Err(_) => RowValue::Null,
        },
    }
}

fn extract_int(value: &Value) -> Result<i64, ConversionError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::UInt(u) => Ok(*u as i64),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            s.parse().map_err(|_| ConversionError::TypeMismatch {
                expected: "integer".to_string(),
                actual: value.clone(),
            })
        }
        _ => Err(ConversionError::TypeMismatch {
            expected: "integer".to_string(),
            actual: value.clone(),
        }),
    }
}

fn extract_float(value: &Value) -> Result<f64, ConversionError> {
    match value {
        Value::Float(f) => Ok(*f as f64),
        Value::Double(d) => Ok(*d),
        Value::Int(i) => Ok(*i as f64),
        Value::UInt(u) => Ok(*u as f64),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            s.parse().map_err(|_| ConversionError::TypeMismatch {
                expected: "float".to_string(),
                actual: value.clone(),
            })
        }
        _ => Err(ConversionError::TypeMismatch {
            expected: "float".to_string(),
            actual: value.clone(),
        }),
    }
}

fn extract_string(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Bytes(b) => Ok(String::from_utf8(b.clone())?),
        Value::Int(i) => Ok(i.to_string()),
        Value::UInt(u) => Ok(u.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Double(d) => Ok(d.to_string()),
        _ => Err(ConversionError::TypeMismatch {
            expected: "string".to_string(),
            actual: value.clone(),
        }),
    }
}

fn extract_bytes(value: &Value) -> Result<Vec<u8>, ConversionError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ConversionError::TypeMismatch {
            expected: "bytes".to_string(),
            actual: value.clone(),
        }),
    }
}

fn extract_date(value: &Value) -> Result<NaiveDate, ConversionError> {
    match value {
        Value::Date(year, month, day, _, _, _, _) => {
            NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .ok_or(ConversionError::InvalidDateTime)
        }
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| ConversionError::InvalidDateTime)
        }
        _ => Err(ConversionError::TypeMismatch {
            expected: "date".to_string(),
            actual: value.clone(),
        }),
    }
}

/// MySQL's own rendering of a date that has no calendar equivalent, such as
/// the zero date `0000-00-00` or `2024-00-00`. Rows carrying these are kept
/// with the value as text.
fn date_text(value: &Value, with_time: bool) -> Result<String, ConversionError> {
    match value {
        Value::Date(year, month, day, hour, min, sec, micro) => {
            let date = format!("{year:04}-{month:02}-{day:02}");
            if !with_time {
                Ok(date)
            } else if *micro > 0 {
                Ok(format!("{date} {hour:02}:{min:02}:{sec:02}.{micro:06}"))
            } else {
                Ok(format!("{date} {hour:02}:{min:02}:{sec:02}"))
            }
        }
        Value::Bytes(b) => Ok(String::from_utf8(b.clone())?),
        _ => Err(ConversionError::TypeMismatch {
            expected: "date".to_string(),
            actual: value.clone(),
        }),
    }
}

/// TIME values keep their textual form since they may exceed 24 hours or be
/// negative.
fn extract_time(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = *days as u64 * 24 + *hours as u64;
            let sign = if *negative { "-" } else { "" };
            if *micros > 0 {
                Ok(format!(
                    "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                ))
            } else {
                Ok(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
            }
        }
        Value::Bytes(b) => Ok(String::from_utf8(b.clone())?),
        _ => Err(ConversionError::TypeMismatch {
            expected: "time".to_string(),
            actual: value.clone(),
        }),
    }
}

fn extract_datetime(value: &Value) -> Result<NaiveDateTime, ConversionError> {
    match value {
        Value::Date(year, month, day, hour, min, sec, micro) => Ok(NaiveDateTime::new(
            NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .ok_or(ConversionError::InvalidDateTime)?,
            NaiveTime::from_hms_micro_opt(*hour as u32, *min as u32, *sec as u32, *micro)
                .ok_or(ConversionError::InvalidDateTime)?,
        )),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| ConversionError::InvalidDateTime)
        }
        _ => Err(ConversionError::TypeMismatch {
            expected: "datetime".to_string(),
            actual: value.clone(),
        }),
    }
}

/// TIMESTAMP columns are stored as seconds since the epoch, optionally with a
/// fractional part (`"1700000000.123456"`).
fn extract_timestamp(value: &Value) -> Result<DateTime<Utc>, ConversionError> {
    match value {
        Value::Int(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or(ConversionError::InvalidDateTime),
        Value::UInt(secs) => Utc
            .timestamp_opt(*secs as i64, 0)
            .single()
            .ok_or(ConversionError::InvalidDateTime),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            parse_epoch(&s).ok_or(ConversionError::InvalidDateTime)
        }
        Value::Date(..) => Ok(Utc.from_utc_datetime(&extract_datetime(value)?)),
        _ => Err(ConversionError::TypeMismatch {
            expected: "timestamp".to_string(),
            actual: value.clone(),
        }),
    }
}

fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match s.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (s, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        // Right-pad to nanosecond precision
        let padded = format!("{frac:0<9}");
        padded.get(..9)?.parse().ok()?
    };
    Utc.timestamp_opt(secs, nanos).single()
}
