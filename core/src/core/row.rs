// rowflow/src/core/row.rs

//! The unit of data moved between stages.

use crate::core::schema::Schema;
use crate::core::value::Value;
use crate::error::{FlowError, FlowResult};
use std::sync::Arc;

/// An immutable value vector matching a [`Schema`] by position.
///
/// The schema is shared (`Arc`) between all rows produced by one stage; a row is
/// owned by exactly one queue slot or stage at a time.
#[derive(Debug, Clone)]
pub struct Row {
  schema: Arc<Schema>,
  values: Vec<Value>,
}

impl Row {
  /// Creates a row without validating arity. Use [`Row::try_new`] for untrusted input.
  pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Self {
    Self { schema, values }
  }

  pub fn try_new(schema: Arc<Schema>, values: Vec<Value>) -> FlowResult<Self> {
    if schema.len() != values.len() {
      return Err(FlowError::SchemaMismatch {
        location: "row construction".to_string(),
        message: format!("schema has {} fields but row has {} values", schema.len(), values.len()),
      });
    }
    Ok(Self { schema, values })
  }

  pub fn schema(&self) -> &Arc<Schema> {
    &self.schema
  }

  pub fn values(&self) -> &[Value] {
    &self.values
  }

  pub fn into_values(self) -> Vec<Value> {
    self.values
  }

  pub fn get(&self, index: usize) -> Option<&Value> {
    self.values.get(index)
  }

  pub fn get_by_name(&self, name: &str) -> Option<&Value> {
    self.schema.index_of(name).and_then(|idx| self.values.get(idx))
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Re-labels the row with another schema of the same arity.
  pub fn with_schema(self, schema: Arc<Schema>) -> FlowResult<Self> {
    Row::try_new(schema, self.values)
  }

  /// Builds a new row of `schema` from these values followed by `extra`.
  pub fn extended(&self, schema: Arc<Schema>, extra: impl IntoIterator<Item = Value>) -> Self {
    let mut values = self.values.clone();
    values.extend(extra);
    Self { schema, values }
  }

  /// True when both rows use the same schema instance or equal schemas.
  pub fn same_layout(&self, other: &Schema) -> bool {
    std::ptr::eq(self.schema.as_ref(), other) || self.schema.as_ref() == other
  }
}

// Rows compare by value; the schema is compared only by layout.
impl PartialEq for Row {
  fn eq(&self, other: &Self) -> bool {
    self.values == other.values && self.same_layout(&other.schema)
  }
}
