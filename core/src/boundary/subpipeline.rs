// rowflow/src/boundary/subpipeline.rs

//! The `sub-pipeline` stage: runs a nested pipeline as an independent run and
//! bridges rows in and out of it through its ports.

use crate::boundary::provider::PipelineProvider;
use crate::boundary::ports::PortBinding;
use crate::boundary::{INPUT_PORT_PLUGIN, OUTPUT_PORT_PLUGIN};
use crate::core::context::InitContext;
use crate::core::control::{RunStatus, StageControl};
use crate::core::queue::{RowQueue, TryPut};
use crate::core::row::Row;
use crate::core::schema::Schema;
use crate::error::{ErrorDetail, ErrorKind, FlowError, FlowResult};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::result::NestedResult;
use crate::pipeline::runner::{RunHandle, Runner};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{event, Level};

const DEFAULT_INPUT_PORT: &str = "input";
const DEFAULT_OUTPUT_PORT: &str = "output";

#[derive(Debug, Deserialize)]
struct SubPipelineConfig {
  #[serde(default)]
  input_port: Option<String>,
  #[serde(default)]
  output_port: Option<String>,
}

fn declares_port(definition: &PipelineDefinition, plugin_id: &str, port: &str) -> bool {
  definition
    .stages
    .iter()
    .any(|s| s.node.is_none() && s.plugin_id == plugin_id && s.port_name() == Some(port))
}

enum Event {
  FromNested(Option<Row>),
  Writable(bool),
  FromParent(Option<Row>),
  Stopped,
}

/// Runs one nested pipeline per copy.
///
/// Config: `{ "input_port"?: "input", "output_port"?: "output", ... }` plus whatever
/// the provider reads (the `definition` entry for the built-in provider). A port
/// is bridged only when the nested definition declares it.
pub struct SubPipelineStage {
  provider: Arc<dyn PipelineProvider>,
  pipeline: String,
  run: Option<RunHandle>,
  to_nested: Option<Arc<RowQueue>>,
  from_nested: Option<Arc<RowQueue>>,
  pending: Option<Row>,
  parent_done: bool,
  nested_done: bool,
}

impl SubPipelineStage {
  pub fn new(provider: Arc<dyn PipelineProvider>) -> Self {
    Self {
      provider,
      pipeline: String::new(),
      run: None,
      to_nested: None,
      from_nested: None,
      pending: None,
      parent_done: false,
      nested_done: false,
    }
  }

  fn stop_feeding(&mut self) {
    self.pending = None;
    self.parent_done = true;
    if let Some(queue) = &self.to_nested {
      queue.close();
    }
  }

  async fn finish(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    self.stop_feeding();
    let Some(handle) = self.run.take() else {
      return Ok(StageControl::Done);
    };
    if ctx.is_stop_requested() {
      handle.stop();
    }
    let result = handle.wait_done().await;
    event!(Level::DEBUG, nested = %self.pipeline, status = ?result.status, "Nested run finished.");
    let failure = (result.status == RunStatus::Errored).then(|| {
      result.first_error.clone().unwrap_or_else(|| ErrorDetail {
        stage: self.pipeline.clone(),
        copy: 0,
        kind: ErrorKind::Run,
        message: "nested run failed".to_string(),
      })
    });
    ctx.attach_nested(NestedResult {
      stage: ctx.stage_name().to_string(),
      copy: ctx.id().copy,
      node: None,
      result,
    });
    match failure {
      Some(detail) => Err(FlowError::SubPipeline {
        pipeline: self.pipeline.clone(),
        detail,
      }),
      None => Ok(StageControl::Done),
    }
  }
}

#[async_trait]
impl Stage for SubPipelineStage {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: SubPipelineConfig = init.config()?;
    let definition = self.provider.definition(init).await?;
    // The nested run sees the parent's parameter values over its own defaults.
    let engine = init.engine().scoped().with_parameters(init.parameters().clone());
    let runner = Runner::new(engine.clone());
    let graph = runner.build(&definition)?;
    let capacity = engine.config().queue_capacity;
    let peer = init.copy().to_string();

    if let Some(schema) = init.input_schema() {
      let port = config.input_port.as_deref().unwrap_or(DEFAULT_INPUT_PORT);
      if declares_port(&definition, INPUT_PORT_PLUGIN, port) {
        let queue = Arc::new(RowQueue::new(
          format!("{} -> {}:{}", peer, definition.name, port),
          capacity,
          graph.signal().clone(),
        ));
        engine
          .ports()
          .bind_input(port, PortBinding::new(queue.clone(), peer.clone()).with_schema(schema.clone()))?;
        self.to_nested = Some(queue);
      }
    }

    let output_port = config.output_port.as_deref().unwrap_or(DEFAULT_OUTPUT_PORT);
    if declares_port(&definition, OUTPUT_PORT_PLUGIN, output_port) {
      let queue = Arc::new(RowQueue::new(
        format!("{}:{} -> {}", definition.name, output_port, peer),
        capacity,
        graph.signal().clone(),
      ));
      engine
        .ports()
        .bind_output(output_port, PortBinding::new(queue.clone(), peer.clone()))?;
      self.from_nested = Some(queue);
    }

    let handle = runner.start(graph).await?;
    let schema = if self.from_nested.is_some() {
      handle
        .output_port_schema(output_port)
        .map(|s| s.as_ref().clone())
        .unwrap_or_default()
    } else {
      Schema::empty()
    };
    event!(Level::DEBUG, copy = %peer, nested = %definition.name, "Nested run started.");

    self.pipeline = definition.name;
    self.parent_done = self.to_nested.is_none();
    self.nested_done = self.from_nested.is_none();
    self.run = Some(handle);
    Ok(schema)
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let want_nested = !self.nested_done;
    let want_write = self.pending.is_some();
    let want_parent = self.pending.is_none() && !self.parent_done;
    if !want_nested && !want_write && !want_parent {
      return self.finish(ctx).await;
    }

    let from = self.from_nested.clone();
    let to = self.to_nested.clone();
    let stop = ctx.stop_signal();
    let event = tokio::select! {
      row = async { match &from { Some(q) => q.get().await, None => None } }, if want_nested => Event::FromNested(row),
      ok = async { match &to { Some(q) => q.writable().await, None => false } }, if want_write => Event::Writable(ok),
      row = ctx.get_row(), if want_parent => Event::FromParent(row),
      _ = stop.stopped() => Event::Stopped,
    };

    match event {
      Event::FromNested(Some(row)) => ctx.emit_row(row).await?,
      Event::FromNested(None) => self.nested_done = true,
      Event::Writable(true) => {
        if let (Some(queue), Some(row)) = (&to, self.pending.take()) {
          match queue.try_put(row)? {
            TryPut::Accepted => {}
            TryPut::Full(row) => self.pending = Some(row),
            TryPut::Closed => self.stop_feeding(),
          }
        }
      }
      Event::Writable(false) => self.stop_feeding(),
      Event::FromParent(Some(row)) => self.pending = Some(row),
      Event::FromParent(None) => self.stop_feeding(),
      Event::Stopped => return self.finish(ctx).await,
    }
    Ok(StageControl::Continue)
  }

  async fn dispose(&mut self) {
    if let Some(handle) = self.run.take() {
      handle.stop();
      let result = handle.wait_done().await;
      event!(Level::DEBUG, nested = %self.pipeline, status = ?result.status, "Nested run stopped on dispose.");
    }
  }
}
