// rowflow/src/stage/context.rs

//! Defines `StageContext`, the side channel a stage uses to talk to the engine.
//!
//! A context is created for one copy when its unit starts and is handed to every
//! `process_once` call. It owns the copy's input reader and output router; rows
//! never move between copies any other way.

use crate::core::context::StageCopyId;
use crate::core::control::StageStatus;
use crate::core::row::Row;
use crate::core::schema::Schema;
use crate::core::signal::{RunSignal, StopSignal};
use crate::core::value::Value;
use crate::error::{FlowError, FlowResult, RowFailure};
use crate::pipeline::definition::ErrorHandling;
use crate::pipeline::hooks::RunHooks;
use crate::pipeline::result::NestedResult;
use crate::stage::input::InputSet;
use crate::stage::metrics::{Checkpoint, StageCounters, StageMetrics};
use crate::stage::output::OutputRouter;
use std::sync::Arc;
use tracing::{event, Level};

pub struct StageContext {
  pipeline: Arc<str>,
  id: StageCopyId,
  inputs: InputSet,
  outputs: OutputRouter,
  input_schema: Option<Arc<Schema>>,
  output_schema: Arc<Schema>,
  error_handling: Option<ErrorHandling>,
  /// Last (source layout, derived error layout) pair.
  error_schema: Option<(Arc<Schema>, Arc<Schema>)>,
  metrics: Arc<StageMetrics>,
  signal: RunSignal,
  hooks: Arc<RunHooks>,
  feedback_interval: u64,
  safe_mode: bool,
  nested: Vec<NestedResult>,
}

/// Everything `StageContext::new` needs besides the queues.
pub(crate) struct ContextSettings {
  pub pipeline: Arc<str>,
  pub input_schema: Option<Arc<Schema>>,
  pub output_schema: Arc<Schema>,
  pub error_handling: Option<ErrorHandling>,
  pub metrics: Arc<StageMetrics>,
  pub signal: RunSignal,
  pub hooks: Arc<RunHooks>,
  pub feedback_interval: u64,
  pub safe_mode: bool,
}

impl StageContext {
  pub(crate) fn new(id: StageCopyId, inputs: InputSet, outputs: OutputRouter, settings: ContextSettings) -> Self {
    Self {
      pipeline: settings.pipeline,
      id,
      inputs,
      outputs,
      input_schema: settings.input_schema,
      output_schema: settings.output_schema,
      error_handling: settings.error_handling,
      error_schema: None,
      metrics: settings.metrics,
      signal: settings.signal,
      hooks: settings.hooks,
      feedback_interval: settings.feedback_interval,
      safe_mode: settings.safe_mode,
      nested: Vec::new(),
    }
  }

  pub fn id(&self) -> &StageCopyId {
    &self.id
  }

  pub fn pipeline_name(&self) -> &str {
    &self.pipeline
  }

  pub fn stage_name(&self) -> &str {
    &self.id.stage
  }

  pub fn input_schema(&self) -> Option<&Arc<Schema>> {
    self.input_schema.as_ref()
  }

  /// The schema returned by this stage's `initialize`.
  pub fn output_schema(&self) -> &Arc<Schema> {
    &self.output_schema
  }

  /// Builds a row of the output schema.
  pub fn new_row(&self, values: Vec<Value>) -> FlowResult<Row> {
    Row::try_new(self.output_schema.clone(), values)
  }

  /// Reads the next input row, parking while all inputs are empty.
  ///
  /// `None` means the copy has no more input: every upstream finished, or the run
  /// was stopped.
  pub async fn get_row(&mut self) -> Option<Row> {
    let row = self.inputs.next(&self.signal).await?;
    self.hooks.fire_row_read(&self.id, &row);
    let read = self.metrics.add_read();
    if self.feedback_interval > 0 && read % self.feedback_interval == 0 {
      self.report_checkpoint();
    }
    Some(row)
  }

  /// Reads an input row only if one is buffered right now.
  pub fn try_get_row(&mut self) -> Option<Row> {
    let row = self.inputs.try_row()?;
    self.hooks.fire_row_read(&self.id, &row);
    let read = self.metrics.add_read();
    if self.feedback_interval > 0 && read % self.feedback_interval == 0 {
      self.report_checkpoint();
    }
    Some(row)
  }

  /// True when an input row is buffered, so `get_row` would not park.
  pub fn input_pending(&self) -> bool {
    self.inputs.has_pending()
  }

  fn check_layout(&self, row: &Row) -> FlowResult<()> {
    if self.safe_mode && !row.same_layout(&self.output_schema) {
      return Err(FlowError::SchemaMismatch {
        location: format!("output of {}", self.id),
        message: format!("row layout {} differs from output schema {}", row.schema(), self.output_schema),
      });
    }
    Ok(())
  }

  fn count_written(&mut self) {
    let written = self.metrics.add_written(1);
    if self.inputs.is_source() && self.feedback_interval > 0 && written % self.feedback_interval == 0 {
      self.report_checkpoint();
    }
  }

  /// Sends a row downstream, parking while the target queue is full.
  ///
  /// A row sent after the run halted, or to a consumer that gave up, is dropped
  /// silently; stages notice the stop through `is_stop_requested` or `get_row`.
  pub async fn emit_row(&mut self, row: Row) -> FlowResult<()> {
    self.signal.wait_while_paused().await;
    self.check_layout(&row)?;
    self.hooks.fire_row_written(&self.id, &row);
    self.outputs.route(row).await?;
    self.count_written();
    Ok(())
  }

  /// Sends a row to the named downstream stage only.
  pub async fn emit_row_to(&mut self, target: &str, row: Row) -> FlowResult<()> {
    self.signal.wait_while_paused().await;
    self.check_layout(&row)?;
    self.hooks.fire_row_written(&self.id, &row);
    self.outputs.route_to(target, row).await?;
    self.count_written();
    Ok(())
  }

  /// Names of the stages this copy feeds.
  pub fn output_targets(&self) -> Vec<&str> {
    self.outputs.groups().iter().map(|g| g.target()).collect()
  }

  pub fn has_error_sink(&self) -> bool {
    self.outputs.has_error_sink()
  }

  /// Rejects a row with an error code and message.
  ///
  /// With an error sink the row goes there and processing continues; without one
  /// the returned error fails the run.
  pub async fn emit_error(&mut self, row: Row, code: &str, message: impl Into<String>) -> FlowResult<()> {
    self.reject(RowFailure::new(row, code, message)).await
  }

  /// Routes a failed row to the error sink, enforcing the rejection thresholds.
  pub async fn reject(&mut self, failure: RowFailure) -> FlowResult<()> {
    let Some(handling) = self.error_handling.clone().filter(|_| self.outputs.has_error_sink()) else {
      return Err(FlowError::RowRejected(Box::new(failure)));
    };

    let schema = self.error_schema_for(&handling, failure.row.schema());
    let extra = [
      Value::Integer(1),
      Value::String(failure.message.clone()),
      Value::String(failure.fields.join(",")),
      Value::String(failure.code.clone()),
    ];
    let error_row = failure.row.extended(schema, extra);

    event!(
      Level::DEBUG,
      copy = %self.id,
      code = %failure.code,
      message = %failure.message,
      "Row routed to error sink."
    );
    self.hooks.fire_error_row(&self.id, &error_row);
    self.outputs.route_error(error_row).await?;

    let rejected = self.metrics.add_rejected();
    let seen = if self.inputs.is_source() {
      self.metrics.rows_written() + rejected
    } else {
      self.metrics.rows_read()
    };
    if handling.threshold_exceeded(rejected, seen) {
      event!(Level::ERROR, copy = %self.id, rejected, seen, "Rejected rows exceed error threshold.");
      return Err(FlowError::TooManyRejected {
        copy: self.id.to_string(),
        rejected,
      });
    }
    Ok(())
  }

  fn error_schema_for(&mut self, handling: &ErrorHandling, source: &Arc<Schema>) -> Arc<Schema> {
    if let Some((cached_source, derived)) = &self.error_schema {
      if Arc::ptr_eq(cached_source, source) || cached_source == source {
        return derived.clone();
      }
    }
    let derived = Arc::new(handling.error_schema(source));
    self.error_schema = Some((source.clone(), derived.clone()));
    derived
  }

  /// Logs the copy's progress and passes it to the checkpoint hooks.
  pub fn report_checkpoint(&self) {
    let checkpoint = Checkpoint {
      stage: self.id.stage.to_string(),
      copy: self.id.copy,
      rows_read: self.metrics.rows_read(),
      rows_written: self.metrics.rows_written(),
    };
    event!(
      Level::INFO,
      pipeline = %self.pipeline,
      copy = %self.id,
      rows_read = checkpoint.rows_read,
      rows_written = checkpoint.rows_written,
      "Checkpoint."
    );
    self.hooks.fire_checkpoint(&checkpoint);
  }

  /// Passes on a checkpoint measured elsewhere on this copy's behalf, such as
  /// by the worker node running it.
  pub fn forward_checkpoint(&self, checkpoint: &Checkpoint) {
    event!(
      Level::DEBUG,
      pipeline = %self.pipeline,
      copy = %self.id,
      rows_read = checkpoint.rows_read,
      rows_written = checkpoint.rows_written,
      "Forwarded checkpoint."
    );
    self.hooks.fire_checkpoint(checkpoint);
  }

  /// True when the run was stopped, or when a safe stop asks this source to quit.
  pub fn is_stop_requested(&self) -> bool {
    self.signal.is_halted() || (self.signal.is_safe_stopping() && self.inputs.is_source())
  }

  /// A listener for stages that park on channels of their own.
  pub fn stop_signal(&self) -> StopSignal {
    StopSignal::new(self.signal.clone())
  }

  /// Rows read from an external system.
  pub fn add_rows_input(&self, rows: u64) {
    self.metrics.add_input(rows);
  }

  /// Rows written to an external system.
  pub fn add_rows_output(&self, rows: u64) {
    self.metrics.add_output(rows);
  }

  /// Attaches the result of a run this copy started on its behalf.
  pub fn attach_nested(&mut self, result: NestedResult) {
    self.nested.push(result);
  }

  pub fn counters(&self) -> StageCounters {
    self.metrics.snapshot(&self.id)
  }

  pub(crate) fn is_source(&self) -> bool {
    self.inputs.is_source()
  }

  pub(crate) fn signal(&self) -> &RunSignal {
    &self.signal
  }

  pub(crate) fn metrics(&self) -> &Arc<StageMetrics> {
    &self.metrics
  }

  pub(crate) fn set_status(&self, status: StageStatus) {
    self.metrics.set_status(status);
  }

  pub(crate) fn close_outputs(&self) {
    self.outputs.close_all();
  }

  pub(crate) fn drain_inputs(&self) {
    self.inputs.drain_all();
  }

  pub(crate) fn take_nested(&mut self) -> Vec<NestedResult> {
    std::mem::take(&mut self.nested)
  }

  pub(crate) fn hooks(&self) -> &Arc<RunHooks> {
    &self.hooks
  }
}
