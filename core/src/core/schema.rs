// rowflow/src/core/schema.rs

//! Row layout descriptors.

use crate::core::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata of one field position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
  pub name: String,
  pub value_type: ValueType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub length: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub precision: Option<u32>,
}

impl FieldMeta {
  pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
    Self {
      name: name.into(),
      value_type,
      length: None,
      precision: None,
    }
  }

  pub fn with_length(mut self, length: u32) -> Self {
    self.length = Some(length);
    self
  }

  pub fn with_precision(mut self, precision: u32) -> Self {
    self.precision = Some(precision);
    self
  }
}

/// Ordered list of fields shared by every row flowing through one queue.
///
/// Schemas are immutable once rows are produced with them; stages that change
/// the row shape build a new schema (usually from `extend`) during initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
  fields: Vec<FieldMeta>,
}

impl Schema {
  pub fn new(fields: Vec<FieldMeta>) -> Self {
    Self { fields }
  }

  pub fn empty() -> Self {
    Self::default()
  }

  /// Builder-style append of a field.
  pub fn field(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
    self.fields.push(FieldMeta::new(name, value_type));
    self
  }

  pub fn push(&mut self, field: FieldMeta) {
    self.fields.push(field);
  }

  /// A copy of this schema with `extra` fields appended.
  pub fn extend<I: IntoIterator<Item = FieldMeta>>(&self, extra: I) -> Self {
    let mut fields = self.fields.clone();
    fields.extend(extra);
    Self { fields }
  }

  pub fn fields(&self) -> &[FieldMeta] {
    &self.fields
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.fields.iter().position(|f| f.name == name)
  }

  pub fn get(&self, name: &str) -> Option<&FieldMeta> {
    self.fields.iter().find(|f| f.name == name)
  }
}

impl fmt::Display for Schema {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (idx, field) in self.fields.iter().enumerate() {
      if idx > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{} {:?}", field.name, field.value_type)?;
    }
    f.write_str("]")
  }
}
