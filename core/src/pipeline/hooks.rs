// rowflow/src/pipeline/hooks.rs

//! Observer callbacks fired by the runner.
//!
//! Hooks are plain synchronous closures invoked on the unit that produced the
//! event. They must be quick and must not block; anything heavier belongs in a
//! channel the closure pushes to.

use crate::core::context::StageCopyId;
use crate::core::row::Row;
use crate::pipeline::result::RunResult;
use crate::stage::metrics::{Checkpoint, StageCounters};
use std::fmt;
use tracing::{event, Level};

type Hook<T> = Box<dyn Fn(&T) + Send + Sync>;
type RowHook = Box<dyn Fn(&StageCopyId, &Row) + Send + Sync>;

#[derive(Default)]
pub struct RunHooks {
  on_start: Vec<Box<dyn Fn(&str) + Send + Sync>>,
  on_checkpoint: Vec<Hook<Checkpoint>>,
  on_stage_finished: Vec<Hook<StageCounters>>,
  on_finish: Vec<Hook<RunResult>>,
  on_row_read: Vec<RowHook>,
  on_row_written: Vec<RowHook>,
  on_error_row: Vec<RowHook>,
}

impl RunHooks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Called with the pipeline name once every copy is initialized and bound.
  pub fn on_start(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.on_start.push(Box::new(hook));
    self
  }

  /// Called for every progress checkpoint of every copy.
  pub fn on_checkpoint(mut self, hook: impl Fn(&Checkpoint) + Send + Sync + 'static) -> Self {
    self.on_checkpoint.push(Box::new(hook));
    self
  }

  /// Called when a copy reaches a terminal status, after its `dispose`.
  pub fn on_stage_finished(mut self, hook: impl Fn(&StageCounters) + Send + Sync + 'static) -> Self {
    self.on_stage_finished.push(Box::new(hook));
    self
  }

  /// Called with the aggregated result when the run is waited on.
  pub fn on_finish(mut self, hook: impl Fn(&RunResult) + Send + Sync + 'static) -> Self {
    self.on_finish.push(Box::new(hook));
    self
  }

  /// Row listeners run on the copy's own unit for every row, so they sit on the
  /// hot path of the run.
  pub fn on_row_read(mut self, hook: impl Fn(&StageCopyId, &Row) + Send + Sync + 'static) -> Self {
    self.on_row_read.push(Box::new(hook));
    self
  }

  /// Called after a row was handed to a downstream queue.
  pub fn on_row_written(mut self, hook: impl Fn(&StageCopyId, &Row) + Send + Sync + 'static) -> Self {
    self.on_row_written.push(Box::new(hook));
    self
  }

  /// Called with each error row routed to an error sink.
  pub fn on_error_row(mut self, hook: impl Fn(&StageCopyId, &Row) + Send + Sync + 'static) -> Self {
    self.on_error_row.push(Box::new(hook));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.on_start.is_empty()
      && self.on_checkpoint.is_empty()
      && self.on_stage_finished.is_empty()
      && self.on_finish.is_empty()
      && self.on_row_read.is_empty()
      && self.on_row_written.is_empty()
      && self.on_error_row.is_empty()
  }

  pub(crate) fn fire_start(&self, pipeline: &str) {
    for hook in &self.on_start {
      hook(pipeline);
    }
  }

  pub(crate) fn fire_checkpoint(&self, checkpoint: &Checkpoint) {
    for hook in &self.on_checkpoint {
      hook(checkpoint);
    }
  }

  pub(crate) fn fire_stage_finished(&self, counters: &StageCounters) {
    for hook in &self.on_stage_finished {
      hook(counters);
    }
  }

  pub(crate) fn fire_row_read(&self, copy: &StageCopyId, row: &Row) {
    for hook in &self.on_row_read {
      hook(copy, row);
    }
  }

  pub(crate) fn fire_row_written(&self, copy: &StageCopyId, row: &Row) {
    for hook in &self.on_row_written {
      hook(copy, row);
    }
  }

  pub(crate) fn fire_error_row(&self, copy: &StageCopyId, row: &Row) {
    for hook in &self.on_error_row {
      hook(copy, row);
    }
  }

  pub(crate) fn fire_finish(&self, result: &RunResult) {
    event!(Level::TRACE, pipeline = %result.pipeline, hooks = self.on_finish.len(), "Firing finish hooks.");
    for hook in &self.on_finish {
      hook(result);
    }
  }
}

impl fmt::Debug for RunHooks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunHooks")
      .field("on_start", &self.on_start.len())
      .field("on_checkpoint", &self.on_checkpoint.len())
      .field("on_stage_finished", &self.on_stage_finished.len())
      .field("on_finish", &self.on_finish.len())
      .field("on_row_read", &self.on_row_read.len())
      .field("on_row_written", &self.on_row_written.len())
      .field("on_error_row", &self.on_error_row.len())
      .finish()
  }
}
