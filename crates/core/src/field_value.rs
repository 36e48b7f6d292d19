use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Semantic type a relation declares for one of its scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Decimal { scale: i64 },
    Boolean,
    Date,
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Integer => write!(f, "integer"),
            Self::Decimal { scale } => write!(f, "decimal({scale})"),
            Self::Boolean => write!(f, "boolean"),
            Self::Date => write!(f, "date"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Canonical scalar value. Variants order before payloads, so keys built from
/// mixed types still sort deterministically.
///
/// `Ordinal` never comes out of field normalization. It only appears in
/// fallback keys, so a positional key part can never equal a declared one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Ordinal(u64),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            FieldValue::Decimal(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Appends a type-tagged, length-prefixed encoding that does not depend on
    /// any serializer's choices. Fingerprints are computed from these bytes.
    pub fn write_canonical(&self, buf: &mut Vec<u8>) {
        match self {
            FieldValue::Null => buf.push(0),
            FieldValue::Text(s) => {
                buf.push(1);
                write_len_prefixed(buf, s.as_bytes());
            }
            FieldValue::Integer(n) => {
                buf.push(2);
                buf.extend_from_slice(&n.to_be_bytes());
            }
            FieldValue::Decimal(d) => {
                buf.push(3);
                let (digits, scale) = d.as_bigint_and_exponent();
                buf.extend_from_slice(&scale.to_be_bytes());
                write_len_prefixed(buf, &digits.to_signed_bytes_be());
            }
            FieldValue::Boolean(b) => {
                buf.push(4);
                buf.push(u8::from(*b));
            }
            FieldValue::Date(d) => {
                buf.push(5);
                buf.extend_from_slice(&d.num_days_from_ce().to_be_bytes());
            }
            FieldValue::Timestamp(ts) => {
                buf.push(6);
                buf.extend_from_slice(&ts.timestamp().to_be_bytes());
                buf.extend_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
            }
            FieldValue::Ordinal(n) => {
                buf.push(7);
                buf.extend_from_slice(&n.to_be_bytes());
            }
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Integer(n) => write!(f, "{n}"),
            FieldValue::Decimal(d) => write!(f, "{d}"),
            FieldValue::Boolean(b) => write!(f, "{b}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::Ordinal(n) => write!(f, "#{n}"),
        }
    }
}
