// rowflow/src/boundary/outbound.rs

//! The `output-port` stage: the exit point of rows from a nested or remote run.

use crate::core::context::{BindContext, InitContext};
use crate::core::control::StageControl;
use crate::core::queue::{PutOutcome, RowQueue};
use crate::core::schema::Schema;
use crate::error::{FlowError, FlowResult};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Debug, Deserialize)]
struct OutputPortConfig {
  port: String,
}

/// Terminal stage putting every input row on the bound queue.
///
/// Config: `{ "port": "<name>" }`. The bound queue is closed when the stage
/// finishes or stops, so the binder always sees end of stream.
#[derive(Debug, Default)]
pub struct OutputPort {
  port: String,
  queue: Option<Arc<RowQueue>>,
}

#[async_trait]
impl Stage for OutputPort {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: OutputPortConfig = init.config()?;
    let schema = init.require_input_schema()?.as_ref().clone();
    self.port = config.port;
    Ok(schema)
  }

  async fn bind(&mut self, bind: &BindContext) -> FlowResult<()> {
    let binding = bind.ports().take_output(&self.port, bind.deadline(), bind.timeout()).await?;
    event!(Level::DEBUG, port = %self.port, peer = %binding.peer, "Output port bound.");
    self.queue = Some(binding.queue);
    Ok(())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let queue = self
      .queue
      .clone()
      .ok_or_else(|| FlowError::Internal(format!("output port '{}' used before bind", self.port)))?;
    let Some(row) = ctx.get_row().await else {
      queue.close();
      return Ok(StageControl::Done);
    };
    match queue.put(row).await? {
      PutOutcome::Accepted => {
        ctx.add_rows_output(1);
        Ok(StageControl::Continue)
      }
      PutOutcome::Closed => {
        event!(Level::DEBUG, port = %self.port, "Output port consumer went away.");
        Ok(StageControl::Done)
      }
    }
  }

  async fn dispose(&mut self) {
    if let Some(queue) = self.queue.take() {
      queue.close();
    }
  }
}
