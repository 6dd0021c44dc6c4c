// rowflow/src/pipeline/runner.rs

//! Starts a built `PipelineGraph` and controls the resulting run.
//!
//! `Runner::start` initializes every copy in topological stage order, completes
//! the bind handshakes, and only then spawns one tokio task per copy. Anything
//! that fails before the spawn is returned as an error with every initialized
//! copy already disposed; anything after it ends up in the `RunResult`.

use crate::boundary::OUTPUT_PORT_PLUGIN;
use crate::core::context::{BindContext, EngineContext, InitContext, StageCopyId};
use crate::core::control::{RunState, RunStatus, StageStatus};
use crate::core::schema::Schema;
use crate::core::signal::RunSignal;
use crate::error::{ErrorDetail, FlowError, FlowResult};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::execution::{CopyOutcome, CopyUnit};
use crate::pipeline::graph::{GraphParts, PipelineGraph};
use crate::pipeline::hooks::RunHooks;
use crate::pipeline::result::{NestedResult, RunResult};
use crate::stage::context::ContextSettings;
use crate::stage::input::InputSet;
use crate::stage::metrics::{StageCounters, StageMetrics};
use crate::stage::output::OutputRouter;
use crate::stage::{Stage, StageContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{event, instrument, Level};

/// Builds and starts runs against one engine context.
#[derive(Debug, Clone)]
pub struct Runner {
  engine: EngineContext,
  hooks: Arc<RunHooks>,
}

impl Runner {
  pub fn new(engine: EngineContext) -> Self {
    Self {
      engine,
      hooks: Arc::new(RunHooks::new()),
    }
  }

  pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
    self.hooks = Arc::new(hooks);
    self
  }

  pub fn engine(&self) -> &EngineContext {
    &self.engine
  }

  pub fn build(&self, definition: &PipelineDefinition) -> FlowResult<PipelineGraph> {
    PipelineGraph::build(definition, &self.engine)
  }

  /// Build, start and wait in one call.
  pub async fn execute(&self, definition: &PipelineDefinition) -> FlowResult<RunResult> {
    let graph = self.build(definition)?;
    let handle = self.start(graph).await?;
    Ok(handle.wait_done().await)
  }

  /// Initializes and binds every copy of `graph`, then spawns their units.
  #[instrument(name = "Runner::start", skip_all, fields(pipeline = %graph.name()), err(Display))]
  pub async fn start(&self, graph: PipelineGraph) -> FlowResult<RunHandle> {
    let GraphParts {
      name,
      signal,
      engine,
      parameters,
      stages,
      copies,
      order,
    } = graph.into_parts();
    let config = engine.config().clone();
    let started_at = Instant::now();

    let metrics: Vec<(StageCopyId, Arc<StageMetrics>)> = copies
      .iter()
      .map(|c| (c.id.clone(), Arc::new(StageMetrics::default())))
      .collect();
    let mut instances: Vec<Option<Box<dyn Stage>>> = copies.iter().map(|_| None).collect();
    let mut initialized: Vec<usize> = Vec::with_capacity(copies.len());
    let mut output_schemas: Vec<Option<Arc<Schema>>> = vec![None; stages.len()];
    let mut input_schemas: Vec<Option<Arc<Schema>>> = vec![None; stages.len()];

    event!(Level::DEBUG, copies = copies.len(), "Initializing stage copies.");
    for &stage_idx in &order {
      let plan = &stages[stage_idx];
      let input_schema = match resolve_input_schema(stage_idx, &stages, &output_schemas, &input_schemas, config.safe_mode) {
        Ok(schema) => schema,
        Err(error) => {
          dispose_all(&mut instances, &initialized).await;
          return Err(FlowError::Initialization {
            copy: format!("{}.0", plan.definition.name),
            source: Box::new(error),
          });
        }
      };
      input_schemas[stage_idx] = input_schema.clone();

      for copy_idx in plan.first_copy..plan.first_copy + plan.copies {
        let id = copies[copy_idx].id.clone();
        let init = InitContext::new(
          &name,
          id.clone(),
          plan.definition.clone(),
          input_schema.clone(),
          engine.clone(),
          parameters.clone(),
        );
        let created = plan.factory.create(&plan.definition);
        let outcome = match created {
          Ok(mut stage) => match stage.initialize(&init).await {
            Ok(schema) => Ok((stage, schema)),
            Err(error) => Err(error),
          },
          Err(error) => Err(error),
        };
        match outcome {
          Ok((stage, schema)) => {
            if output_schemas[stage_idx].is_none() {
              output_schemas[stage_idx] = Some(Arc::new(schema));
            }
            instances[copy_idx] = Some(stage);
            initialized.push(copy_idx);
            metrics[copy_idx].1.set_status(StageStatus::Initialized);
          }
          Err(error) => {
            event!(Level::ERROR, copy = %id, error = %error, "Stage copy failed to initialize.");
            dispose_all(&mut instances, &initialized).await;
            return Err(FlowError::Initialization {
              copy: id.to_string(),
              source: Box::new(error),
            });
          }
        }
      }
    }

    let bind = BindContext::new(engine.ports().clone(), config.bind_timeout());
    for &copy_idx in &initialized {
      let Some(stage) = instances[copy_idx].as_mut() else {
        continue;
      };
      if let Err(error) = stage.bind(&bind).await {
        event!(Level::ERROR, copy = %copies[copy_idx].id, error = %error, "Stage copy failed to bind.");
        dispose_all(&mut instances, &initialized).await;
        return Err(error);
      }
    }

    let mut port_schemas = HashMap::new();
    let mut stage_schemas = HashMap::new();
    for (stage_idx, plan) in stages.iter().enumerate() {
      let Some(schema) = output_schemas[stage_idx].clone() else {
        continue;
      };
      if plan.definition.plugin_id == OUTPUT_PORT_PLUGIN && plan.definition.node.is_none() {
        if let Some(port) = plan.definition.port_name() {
          port_schemas.insert(port.to_string(), schema.clone());
        }
      }
      stage_schemas.insert(plan.definition.name.clone(), schema);
    }

    let pipeline: Arc<str> = Arc::from(name.as_str());
    signal.mark_started();
    self.hooks.fire_start(&name);
    event!(Level::INFO, stages = stages.len(), copies = copies.len(), "Pipeline run started.");

    let mut tasks = JoinSet::new();
    for (copy_idx, plan) in copies.into_iter().enumerate() {
      let Some(stage) = instances[copy_idx].take() else {
        continue;
      };
      let stage_plan = &stages[plan.stage];
      let inputs = InputSet::new(plan.inputs, plan.readable, stage.input_strategy(), config.input_block_size);
      let outputs = OutputRouter::new(plan.outputs, plan.errors, stage_plan.definition.distribution);
      let settings = ContextSettings {
        pipeline: pipeline.clone(),
        input_schema: input_schemas[plan.stage].clone(),
        output_schema: output_schemas[plan.stage].clone().unwrap_or_default(),
        error_handling: stage_plan.definition.error_handling.clone(),
        metrics: metrics[copy_idx].1.clone(),
        signal: signal.clone(),
        hooks: self.hooks.clone(),
        feedback_interval: config.feedback_interval,
        safe_mode: config.safe_mode,
      };
      let ctx = StageContext::new(plan.id, inputs, outputs, settings);
      tasks.spawn(CopyUnit { stage, ctx }.run());
    }

    Ok(RunHandle {
      pipeline: name,
      signal,
      tasks,
      metrics,
      port_schemas,
      stage_schemas,
      hooks: self.hooks.clone(),
      started_at,
    })
  }
}

/// The input schema of a stage: the output of its first upstream stage, or the
/// error layout of its first error source for pure error sinks.
fn resolve_input_schema(
  stage_idx: usize,
  stages: &[crate::pipeline::graph::StagePlan],
  output_schemas: &[Option<Arc<Schema>>],
  input_schemas: &[Option<Arc<Schema>>],
  safe_mode: bool,
) -> FlowResult<Option<Arc<Schema>>> {
  let plan = &stages[stage_idx];
  if let Some(&first) = plan.upstream.first() {
    let schema = output_schemas[first].clone();
    if safe_mode {
      for &other in &plan.upstream[1..] {
        if output_schemas[other] != schema {
          return Err(FlowError::SchemaMismatch {
            location: format!("input of stage '{}'", plan.definition.name),
            message: format!(
              "upstream '{}' and '{}' publish different layouts",
              stages[first].definition.name, stages[other].definition.name
            ),
          });
        }
      }
    }
    return Ok(schema);
  }
  if let Some(&source) = plan.error_sources.first() {
    let base = input_schemas[source].clone().or_else(|| output_schemas[source].clone());
    let handling = stages[source].definition.error_handling.as_ref();
    if let (Some(base), Some(handling)) = (base, handling) {
      return Ok(Some(Arc::new(handling.error_schema(&base))));
    }
  }
  Ok(None)
}

/// Disposes initialized copies in reverse initialization order.
async fn dispose_all(instances: &mut [Option<Box<dyn Stage>>], initialized: &[usize]) {
  for &copy_idx in initialized.iter().rev() {
    if let Some(mut stage) = instances[copy_idx].take() {
      stage.dispose().await;
    }
  }
}

/// A cloneable handle for controlling a run from elsewhere.
#[derive(Debug, Clone)]
pub struct RunController {
  signal: RunSignal,
}

impl RunController {
  pub fn stop(&self) {
    event!(Level::INFO, "Stop requested.");
    self.signal.stop();
  }

  pub fn safe_stop(&self) {
    event!(Level::INFO, "Safe stop requested.");
    self.signal.safe_stop();
  }

  pub fn pause(&self) {
    self.signal.pause();
  }

  pub fn resume(&self) {
    self.signal.resume();
  }

  pub fn state(&self) -> RunState {
    self.signal.state()
  }

  /// Fails the run from outside its units, e.g. when the peer feeding it vanished.
  pub(crate) fn fail(&self, detail: ErrorDetail) {
    event!(Level::ERROR, detail = %detail, "Run failed from outside.");
    self.signal.fail(detail);
  }

  /// Fails the run unless it already halted; a stopped run stays stopped.
  pub(crate) fn fail_if_running(&self, detail: ErrorDetail) -> bool {
    if self.signal.is_halted() {
      event!(Level::DEBUG, detail = %detail, "Run already halted; failure ignored.");
      return false;
    }
    self.fail(detail);
    true
  }
}

/// A started run.
pub struct RunHandle {
  pipeline: String,
  signal: RunSignal,
  tasks: JoinSet<CopyOutcome>,
  metrics: Vec<(StageCopyId, Arc<StageMetrics>)>,
  port_schemas: HashMap<String, Arc<Schema>>,
  stage_schemas: HashMap<String, Arc<Schema>>,
  hooks: Arc<RunHooks>,
  started_at: Instant,
}

impl RunHandle {
  pub fn pipeline_name(&self) -> &str {
    &self.pipeline
  }

  /// Halts every unit at its next blocking point.
  pub fn stop(&self) {
    event!(Level::INFO, pipeline = %self.pipeline, "Stop requested.");
    self.signal.stop();
  }

  /// Source stages stop producing; the rest of the graph drains normally.
  pub fn safe_stop(&self) {
    event!(Level::INFO, pipeline = %self.pipeline, "Safe stop requested.");
    self.signal.safe_stop();
  }

  pub fn pause(&self) {
    self.signal.pause();
  }

  pub fn resume(&self) {
    self.signal.resume();
  }

  pub fn state(&self) -> RunState {
    self.signal.state()
  }

  pub fn controller(&self) -> RunController {
    RunController {
      signal: self.signal.clone(),
    }
  }

  /// Live counters of every copy.
  pub fn counters(&self) -> Vec<StageCounters> {
    self.metrics.iter().map(|(id, m)| m.snapshot(id)).collect()
  }

  /// The layout rows leave the run through the output port `port`.
  pub fn output_port_schema(&self, port: &str) -> Option<Arc<Schema>> {
    self.port_schemas.get(port).cloned()
  }

  pub fn stage_output_schema(&self, stage: &str) -> Option<Arc<Schema>> {
    self.stage_schemas.get(stage).cloned()
  }

  /// Awaits every unit and aggregates the run's outcome.
  pub async fn wait_done(mut self) -> RunResult {
    let mut nested: Vec<NestedResult> = Vec::new();
    while let Some(joined) = self.tasks.join_next().await {
      match joined {
        Ok(outcome) => nested.extend(outcome.nested),
        Err(join_error) => {
          event!(Level::ERROR, pipeline = %self.pipeline, error = %join_error, "Execution unit did not complete.");
          self.signal.fail(ErrorDetail::new(
            self.pipeline.clone(),
            0,
            &FlowError::Internal(format!("execution unit failed: {}", join_error)),
          ));
        }
      }
    }

    for (_, metrics) in &self.metrics {
      if !metrics.status().is_terminal() {
        metrics.set_status(StageStatus::Errored);
      }
    }

    let status = if self.signal.is_errored() {
      RunStatus::Errored
    } else if self.signal.is_stop_requested() {
      RunStatus::Stopped
    } else {
      RunStatus::Success
    };
    self.signal.mark_finished();

    let result = RunResult {
      pipeline: self.pipeline.clone(),
      status,
      stages: self.counters(),
      elapsed: self.started_at.elapsed(),
      first_error: self.signal.first_error(),
      nested,
    };
    event!(
      Level::INFO,
      pipeline = %self.pipeline,
      status = ?result.status,
      elapsed_ms = result.elapsed.as_millis() as u64,
      "Pipeline run finished."
    );
    self.hooks.fire_finish(&result);
    result
  }
}

impl std::fmt::Debug for RunHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunHandle")
      .field("pipeline", &self.pipeline)
      .field("state", &self.signal.state())
      .field("copies", &self.metrics.len())
      .finish()
  }
}
