// rowflow/src/core/value.rs

//! Typed values carried by rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
  Integer,
  Number,
  String,
  Boolean,
  Timestamp,
  Binary,
}

/// A single cell of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
  Null,
  Integer(i64),
  Number(#[serde(with = "float_repr")] f64),
  String(String),
  Boolean(bool),
  /// Milliseconds since the Unix epoch.
  Timestamp(i64),
  Binary(Vec<u8>),
}

/// JSON has no NaN or infinities; those travel as `"NaN"`, `"inf"` and `"-inf"`.
mod float_repr {
  use serde::de::{self, Unexpected, Visitor};
  use serde::{Deserializer, Serializer};
  use std::fmt;

  pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
      serializer.serialize_f64(*value)
    } else if value.is_nan() {
      serializer.serialize_str("NaN")
    } else if value.is_sign_positive() {
      serializer.serialize_str("inf")
    } else {
      serializer.serialize_str("-inf")
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    deserializer.deserialize_any(FloatVisitor)
  }

  struct FloatVisitor;

  impl Visitor<'_> for FloatVisitor {
    type Value = f64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("a number, \"NaN\", \"inf\" or \"-inf\"")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
      Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
      Ok(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
      Ok(v as f64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
      match v {
        "NaN" => Ok(f64::NAN),
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => Err(E::invalid_value(Unexpected::Str(other), &self)),
      }
    }
  }
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// The type of a non-null value.
  pub fn value_type(&self) -> Option<ValueType> {
    match self {
      Value::Null => None,
      Value::Integer(_) => Some(ValueType::Integer),
      Value::Number(_) => Some(ValueType::Number),
      Value::String(_) => Some(ValueType::String),
      Value::Boolean(_) => Some(ValueType::Boolean),
      Value::Timestamp(_) => Some(ValueType::Timestamp),
      Value::Binary(_) => Some(ValueType::Binary),
    }
  }

  /// Integer view used by modulo partitioning. Strings are parsed, numbers truncated.
  pub fn as_integer(&self) -> Option<i64> {
    match self {
      Value::Integer(v) | Value::Timestamp(v) => Some(*v),
      Value::Number(v) => Some(*v as i64),
      Value::Boolean(v) => Some(i64::from(*v)),
      Value::String(s) => s.trim().parse().ok(),
      Value::Null | Value::Binary(_) => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  /// Feeds a canonical byte encoding of the value to `sink`.
  ///
  /// The encoding only depends on the value, so every node of a cluster derives
  /// the same hash for the same key.
  pub(crate) fn write_canonical(&self, sink: &mut impl FnMut(&[u8])) {
    match self {
      Value::Null => sink(&[0]),
      Value::Integer(v) => {
        sink(&[1]);
        sink(&v.to_be_bytes());
      }
      Value::Number(v) => {
        sink(&[2]);
        sink(&v.to_bits().to_be_bytes());
      }
      Value::String(s) => {
        sink(&[3]);
        sink(s.as_bytes());
      }
      Value::Boolean(v) => sink(&[4, u8::from(*v)]),
      Value::Timestamp(v) => {
        sink(&[5]);
        sink(&v.to_be_bytes());
      }
      Value::Binary(b) => {
        sink(&[6]);
        sink(b);
      }
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => f.write_str("null"),
      Value::Integer(v) => write!(f, "{}", v),
      Value::Number(v) => write!(f, "{}", v),
      Value::String(s) => f.write_str(s),
      Value::Boolean(v) => write!(f, "{}", v),
      Value::Timestamp(v) => write!(f, "@{}", v),
      Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Integer(v)
  }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self {
    Value::Integer(i64::from(v))
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Number(v)
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Boolean(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::String(v.to_string())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::String(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map_or(Value::Null, Into::into)
  }
}
