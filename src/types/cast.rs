//! Total cast function between value types.
//!
//! Casting never panics: every (value, target) pair either produces a value
//! of the target type or a type mismatch error. Null casts to Null for every
//! target. Text parsing does not trim whitespace.

use crate::error::{Error, Result};
use crate::types::{Value, ValueType};
use chrono::{DateTime, SecondsFormat, Utc};

/// Canonical text form of a double: shortest round-trip digits, scientific
/// notation outside the [1e-6, 1e15) absolute range, and a forced `.0` on
/// integral values so they stay distinguishable from integers.
pub fn format_double(f: f64) -> String {
    let abs = f.abs();
    if abs != 0.0 && (abs < 1e-6 || abs >= 1e15) {
        format!("{f:e}")
    } else if f == f.trunc() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

pub fn format_timestamp(nanos: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(nanos).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(text: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(text).map_err(|_| Error::TypeMismatch {
        expected: ValueType::Timestamp.as_str().into(),
        got: format!("text '{text}'"),
    })?;
    parsed
        .timestamp_nanos_opt()
        .ok_or_else(|| Error::OutOfRange(format!("timestamp '{text}' outside nanosecond range")))
}

fn mismatch(target: ValueType, v: &Value) -> Error {
    Error::TypeMismatch {
        expected: target.as_str().into(),
        got: v.value_type().as_str().into(),
    }
}

fn double_to_integer(d: f64) -> Result<i64> {
    if d.fract() != 0.0 {
        return Err(Error::TypeMismatch {
            expected: ValueType::Integer.as_str().into(),
            got: format!("double {}", format_double(d)),
        });
    }
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range, so a
    // strict < comparison excludes exactly the unrepresentable tail.
    if d < i64::MIN as f64 || d >= i64::MAX as f64 {
        return Err(Error::TypeMismatch {
            expected: ValueType::Integer.as_str().into(),
            got: format!("double {}", format_double(d)),
        });
    }
    Ok(d as i64)
}

pub fn cast(v: Value, target: ValueType) -> Result<Value> {
    if target.is_any() || v.is_null() || v.value_type() == target {
        return Ok(v);
    }

    match target {
        ValueType::Boolean => match v {
            Value::Integer(i) => Ok(Value::Boolean(i != 0)),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Integer => match v {
            Value::Boolean(b) => Ok(Value::Integer(i64::from(b))),
            Value::Double(d) => double_to_integer(d).map(Value::Integer),
            Value::Text(s) => s.parse::<i64>().map(Value::Integer).map_err(|_| {
                Error::TypeMismatch {
                    expected: target.as_str().into(),
                    got: format!("text '{s}'"),
                }
            }),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Double => match v {
            Value::Integer(i) => Ok(Value::Double(i as f64)),
            Value::Text(s) => s.parse::<f64>().map(Value::Double).map_err(|_| {
                Error::TypeMismatch {
                    expected: target.as_str().into(),
                    got: format!("text '{s}'"),
                }
            }),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Text => match v {
            Value::Boolean(b) => Ok(Value::text(if b { "true" } else { "false" })),
            Value::Integer(i) => Ok(Value::text(i.to_string())),
            Value::Double(d) => Ok(Value::text(format_double(d))),
            Value::Timestamp(ns) => Ok(Value::text(format_timestamp(ns))),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Blob => match v {
            Value::Text(s) => Ok(Value::Blob(s.into_string().into_bytes())),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Timestamp => match v {
            Value::Text(s) => parse_timestamp(&s).map(Value::Timestamp),
            other => Err(mismatch(target, &other)),
        },
        ValueType::Object | ValueType::Array | ValueType::Null => Err(mismatch(target, &v)),
        ValueType::Any => unreachable!("handled above"),
    }
}
