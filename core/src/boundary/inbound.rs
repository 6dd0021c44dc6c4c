// rowflow/src/boundary/inbound.rs

//! The `input-port` stage: the entry point of rows into a nested or remote run.

use crate::core::context::{BindContext, InitContext};
use crate::core::control::StageControl;
use crate::core::queue::RowQueue;
use crate::core::schema::{FieldMeta, Schema};
use crate::error::{FlowError, FlowResult};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Debug, Deserialize)]
struct InputPortConfig {
  port: String,
  #[serde(default)]
  fields: Option<Vec<FieldMeta>>,
}

/// Forwards the rows its binder puts on the bound queue.
///
/// Config: `{ "port": "<name>", "fields"?: [..] }`. Without declared fields the
/// output schema is the one announced by the binding.
#[derive(Debug, Default)]
pub struct InputPort {
  port: String,
  schema: Arc<Schema>,
  queue: Option<Arc<RowQueue>>,
}

#[async_trait]
impl Stage for InputPort {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: InputPortConfig = init.config()?;
    let schema = match config.fields {
      Some(fields) => Schema::new(fields),
      None => init
        .engine()
        .ports()
        .input_schema(&config.port)
        .map(|s| s.as_ref().clone())
        .ok_or_else(|| {
          FlowError::config(
            init.stage_name(),
            format!("port '{}' declares no fields and no schema is bound", config.port),
          )
        })?,
    };
    self.port = config.port;
    self.schema = Arc::new(schema.clone());
    Ok(schema)
  }

  async fn bind(&mut self, bind: &BindContext) -> FlowResult<()> {
    let binding = bind.ports().take_input(&self.port, bind.deadline(), bind.timeout()).await?;
    event!(Level::DEBUG, port = %self.port, peer = %binding.peer, "Input port bound.");
    self.queue = Some(binding.queue);
    Ok(())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let queue = self
      .queue
      .as_ref()
      .ok_or_else(|| FlowError::Internal(format!("input port '{}' used before bind", self.port)))?;
    match queue.get().await {
      Some(row) => {
        let row = if row.same_layout(&self.schema) {
          row
        } else {
          row.with_schema(self.schema.clone())?
        };
        ctx.emit_row(row).await?;
        Ok(StageControl::Continue)
      }
      None => Ok(StageControl::Done),
    }
  }

  async fn dispose(&mut self) {
    if let Some(queue) = self.queue.take() {
      queue.drain();
    }
  }
}
