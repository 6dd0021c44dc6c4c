// rowflow/src/stage/builtin.rs

//! Generic stages shipped with the engine.

use crate::core::context::InitContext;
use crate::core::control::StageControl;
use crate::core::row::Row;
use crate::core::schema::{FieldMeta, Schema};
use crate::core::value::{Value, ValueType};
use crate::error::{FlowError, FlowResult};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub const GENERATE_ROWS_PLUGIN: &str = "generate-rows";
pub const DUMMY_PLUGIN: &str = "dummy";

#[derive(Debug, Deserialize)]
struct GenerateRowsConfig {
  fields: Vec<FieldMeta>,
  #[serde(default)]
  rows: Vec<Vec<JsonValue>>,
  /// Total rows to emit, cycling through `rows`. Defaults to `rows.len()`.
  #[serde(default)]
  limit: Option<u64>,
}

/// Source stage emitting a fixed set of rows, optionally repeated up to a limit.
///
/// Config: `{ "fields": [{ "name", "value_type" }], "rows": [[..]], "limit"? }`.
/// Row cells are plain JSON values converted to the declared field types.
#[derive(Debug, Default)]
pub struct GenerateRows {
  rows: Vec<Row>,
  limit: u64,
  emitted: u64,
}

fn convert(stage: &str, field: &FieldMeta, raw: &JsonValue) -> FlowResult<Value> {
  if raw.is_null() {
    return Ok(Value::Null);
  }
  let value = match field.value_type {
    ValueType::Integer => raw.as_i64().map(Value::Integer),
    ValueType::Timestamp => raw.as_i64().map(Value::Timestamp),
    ValueType::Number => raw.as_f64().map(Value::Number),
    ValueType::Boolean => raw.as_bool().map(Value::Boolean),
    ValueType::String => raw.as_str().map(|s| Value::String(s.to_string())),
    ValueType::Binary => raw.as_str().map(|s| Value::Binary(s.as_bytes().to_vec())),
  };
  value.ok_or_else(|| {
    FlowError::config(
      stage,
      format!("value {} does not fit field '{}' of type {:?}", raw, field.name, field.value_type),
    )
  })
}

#[async_trait]
impl Stage for GenerateRows {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: GenerateRowsConfig = init.config()?;
    let schema = Arc::new(Schema::new(config.fields));

    let mut rows = Vec::with_capacity(config.rows.len());
    for raw in &config.rows {
      if raw.len() != schema.len() {
        return Err(FlowError::config(
          init.stage_name(),
          format!("row has {} cells but {} fields are declared", raw.len(), schema.len()),
        ));
      }
      let values = schema
        .fields()
        .iter()
        .zip(raw)
        .map(|(field, cell)| convert(init.stage_name(), field, cell))
        .collect::<FlowResult<Vec<_>>>()?;
      rows.push(Row::new(schema.clone(), values));
    }

    self.limit = config.limit.unwrap_or(rows.len() as u64);
    if self.limit > 0 && rows.is_empty() {
      return Err(FlowError::config(init.stage_name(), "a row limit needs at least one row"));
    }
    self.rows = rows;
    self.emitted = 0;
    Ok(schema.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    if self.emitted >= self.limit || ctx.is_stop_requested() {
      return Ok(StageControl::Done);
    }
    let row = self.rows[(self.emitted % self.rows.len() as u64) as usize].clone();
    self.emitted += 1;
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

/// Pass-through stage: every input row is emitted unchanged.
#[derive(Debug, Default)]
pub struct Dummy;

#[async_trait]
impl Stage for Dummy {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Ok(init.input_schema().map(|s| s.as_ref().clone()).unwrap_or_default())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    match ctx.get_row().await {
      Some(row) => {
        ctx.emit_row(row).await?;
        Ok(StageControl::Continue)
      }
      None => Ok(StageControl::Done),
    }
  }
}
