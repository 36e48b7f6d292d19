//! Scalar coercion from loosely typed source values to canonical `FieldValue`s.
//!
//! Every declared `FieldType` has exactly one coercion function. Values that do
//! not fit are reported as `SchemaMismatch`, never defaulted.

use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::field_value::{FieldType, FieldValue};
use crate::schema::FieldSpec;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Largest integer an f64 holds exactly.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Digits left of the point in `i64::MAX`.
const MAX_INTEGER_DIGITS: i64 = 19;

/// Digits left of the point a decimal field accepts.
const MAX_DECIMAL_DIGITS: i64 = 38;

pub fn normalize_field(
    relation: &str,
    field: &FieldSpec,
    raw: Option<&Value>,
) -> Result<FieldValue, CoreError> {
    let Some(value) = raw.filter(|v| !is_null_like(v)) else {
        return Ok(FieldValue::Null);
    };
    let mismatch = |reason: String| CoreError::mismatch(relation, &field.name, reason);

    if matches!(value, Value::Array(_) | Value::Object(_)) {
        return Err(mismatch(format!(
            "expected a scalar for {}, found a nested structure",
            field.field_type
        )));
    }

    match field.field_type {
        FieldType::Text => Ok(FieldValue::Text(coerce_text(value))),
        FieldType::Integer => coerce_integer(value).map(FieldValue::Integer).map_err(mismatch),
        FieldType::Decimal { scale } => coerce_decimal(value, scale)
            .map(FieldValue::Decimal)
            .map_err(mismatch),
        FieldType::Boolean => coerce_boolean(value).map(FieldValue::Boolean).map_err(mismatch),
        FieldType::Date => coerce_date(value).map(FieldValue::Date).map_err(mismatch),
        FieldType::Timestamp => coerce_timestamp(value)
            .map(FieldValue::Timestamp)
            .map_err(mismatch),
    }
}

/// Absent keys, JSON null, blank strings and the literal `"null"` all mean null.
pub fn is_null_like(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let t = s.trim();
            t.is_empty() || t.eq_ignore_ascii_case("null")
        }
        _ => false,
    }
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64 => Ok(f as i64),
                _ => Err(format!("{n} is not an integer")),
            }
        }
        Value::String(s) => {
            let t = s.trim();
            if let Ok(i) = t.parse::<i64>() {
                return Ok(i);
            }
            let d = BigDecimal::from_str(t).map_err(|_| format!("{t:?} is not an integer"))?;
            if d.is_zero() {
                return Ok(0);
            }
            // rescaling expands the exponent, so range is checked on the
            // unexpanded form first
            let digits = integer_digits(&d);
            if digits > MAX_INTEGER_DIGITS {
                return Err(format!("{t:?} is out of integer range"));
            }
            if digits <= 0 || !d.is_integer() {
                return Err(format!("{t:?} has a fractional part"));
            }
            d.with_scale(0)
                .to_string()
                .parse::<i64>()
                .map_err(|_| format!("{t:?} is out of integer range"))
        }
        other => Err(format!("cannot read {other} as an integer")),
    }
}

fn coerce_decimal(value: &Value, scale: i64) -> Result<BigDecimal, String> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(format!("cannot read {other} as a decimal")),
    };
    let d = BigDecimal::from_str(&text).map_err(|_| format!("{text:?} is not a decimal"))?;
    if d.is_zero() {
        return Ok(BigDecimal::zero().with_scale(scale));
    }
    let digits = integer_digits(&d);
    if digits > MAX_DECIMAL_DIGITS {
        return Err(format!("{text:?} exceeds {MAX_DECIMAL_DIGITS} integer digits"));
    }
    // below half a unit of the last kept place: rounds to zero
    if digits <= -(scale + 1) {
        return Ok(BigDecimal::zero().with_scale(scale));
    }
    Ok(d.with_scale_round(scale, RoundingMode::HalfEven))
}

/// Count of digits left of the decimal point, computed without expanding the
/// exponent. Zero or negative for magnitudes below one.
fn integer_digits(d: &BigDecimal) -> i64 {
    let (_, exponent) = d.as_bigint_and_exponent();
    i64::try_from(d.digits())
        .unwrap_or(i64::MAX)
        .saturating_sub(exponent)
}

fn coerce_boolean(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{n} is not a boolean")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(true),
            "false" | "f" | "no" | "n" | "0" => Ok(false),
            other => Err(format!("{other:?} is not a boolean")),
        },
        other => Err(format!("cannot read {other} as a boolean")),
    }
}

fn coerce_date(value: &Value) -> Result<NaiveDate, String> {
    if let Value::String(s) = value {
        if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
            return Ok(date);
        }
    }
    coerce_timestamp(value)
        .map(|ts| ts.date_naive())
        .map_err(|_| format!("{value} is not a date"))
}

fn coerce_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| format!("{n} is not an epoch-millisecond timestamp")),
        Value::String(s) => parse_timestamp(s.trim()).ok_or_else(|| format!("{s:?} is not a timestamp")),
        other => Err(format!("cannot read {other} as a timestamp")),
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    // offsets without a colon, e.g. +0000
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
