// rowflow/src/stage/mod.rs

//! The stage plugin contract and the per-copy runtime pieces around it.
//!
//! A stage is a small closed interface (`initialize` / `bind` / `process_once` /
//! `dispose`) implemented by every operator and selected through the
//! [`StageRegistry`](crate::StageRegistry) by plugin id. Each copy of a stage owns
//! its own instance; all interaction with other copies happens through the
//! [`StageContext`] it is handed on every call.

pub mod builtin;
pub mod context;
pub(crate) mod input;
pub mod metrics;
pub(crate) mod output;

use crate::core::context::{BindContext, InitContext};
use crate::core::control::StageControl;
use crate::core::schema::Schema;
use crate::error::FlowResult;
use async_trait::async_trait;

pub use context::StageContext;
pub use metrics::{Checkpoint, StageCounters};

/// How a copy reads when it has several input queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputStrategy {
  /// Read a block of rows from one queue, then move to the next non-empty one.
  #[default]
  RoundRobin,
  /// Exhaust the first queue before reading the second, and so on.
  Sequential,
}

/// The contract every stage plugin implements.
///
/// Lifecycle: `initialize` once, `bind` once, `process_once` until it returns
/// [`StageControl::Done`] or fails (or the run stops), then `dispose` once.
#[async_trait]
pub trait Stage: Send {
  /// Validates the configuration, acquires resources and returns the output schema.
  ///
  /// Called before any row flows. An error aborts the whole run; copies that were
  /// already initialized are disposed.
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema>;

  /// Completes any late-binding handshake before the first row may flow.
  async fn bind(&mut self, _bind: &BindContext) -> FlowResult<()> {
    Ok(())
  }

  /// Performs one unit of work, typically reading one row and emitting its results.
  ///
  /// Returning `Err(FlowError::RowRejected(..))` routes the row to the stage's error
  /// sink when one is attached; any other error fails the run.
  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl>;

  /// Releases resources. Runs exactly once for every initialized copy.
  async fn dispose(&mut self) {}

  fn input_strategy(&self) -> InputStrategy {
    InputStrategy::RoundRobin
  }
}
