// rowflow/src/pipeline/execution.rs

//! The execution unit of one stage copy: the `process_once` loop and its
//! transitions to a terminal status.

use crate::core::context::StageCopyId;
use crate::core::control::{StageControl, StageStatus};
use crate::core::signal::RunSignal;
use crate::error::{ErrorDetail, FlowError};
use crate::pipeline::result::NestedResult;
use crate::stage::metrics::StageMetrics;
use crate::stage::{Stage, StageContext};
use std::sync::Arc;
use tracing::{event, span, Instrument, Level};

/// What a finished unit hands back to the run handle.
#[derive(Debug, Default)]
pub(crate) struct CopyOutcome {
  pub nested: Vec<NestedResult>,
}

/// Fails the run when a unit unwinds out of stage code.
struct PanicGuard {
  id: StageCopyId,
  signal: RunSignal,
  metrics: Arc<StageMetrics>,
}

impl Drop for PanicGuard {
  fn drop(&mut self) {
    if std::thread::panicking() {
      event!(Level::ERROR, copy = %self.id, "Stage copy panicked.");
      self.metrics.add_error();
      self.metrics.set_status(StageStatus::Errored);
      self.signal.fail(ErrorDetail::new(
        self.id.stage.to_string(),
        self.id.copy,
        &FlowError::Internal("stage copy panicked".to_string()),
      ));
    }
  }
}

pub(crate) struct CopyUnit {
  pub stage: Box<dyn Stage>,
  pub ctx: StageContext,
}

impl CopyUnit {
  pub async fn run(self) -> CopyOutcome {
    let span = span!(
      Level::INFO,
      "stage_copy_execution",
      pipeline = %self.ctx.pipeline_name(),
      copy = %self.ctx.id()
    );
    self.run_inner().instrument(span).await
  }

  fn fail(ctx: &StageContext, error: &FlowError) {
    event!(Level::ERROR, error = %error, "Stage copy failed.");
    ctx.metrics().add_error();
    let detail = ErrorDetail::new(ctx.stage_name(), ctx.id().copy, error);
    if ctx.signal().fail(detail) {
      event!(Level::DEBUG, "Recorded as the run's first error.");
    }
  }

  async fn run_inner(self) -> CopyOutcome {
    let CopyUnit { mut stage, mut ctx } = self;
    let _guard = PanicGuard {
      id: ctx.id().clone(),
      signal: ctx.signal().clone(),
      metrics: ctx.metrics().clone(),
    };

    ctx.set_status(StageStatus::Running);
    event!(Level::DEBUG, "Stage copy running.");

    let mut status = loop {
      if ctx.signal().is_halted() {
        break StageStatus::Stopped;
      }
      if ctx.is_source() && ctx.signal().is_safe_stopping() {
        event!(Level::DEBUG, "Source copy leaving on safe stop.");
        break StageStatus::Finished;
      }
      if ctx.signal().is_paused() {
        ctx.signal().wait_while_paused().await;
        continue;
      }

      match stage.process_once(&mut ctx).await {
        Ok(StageControl::Continue) => {}
        Ok(StageControl::Done) => break StageStatus::Finished,
        Err(FlowError::RowRejected(failure)) if ctx.has_error_sink() => {
          if let Err(error) = ctx.reject(*failure).await {
            Self::fail(&ctx, &error);
            break StageStatus::Errored;
          }
        }
        Err(error) => {
          Self::fail(&ctx, &error);
          break StageStatus::Errored;
        }
      }
    };

    if status == StageStatus::Finished && ctx.signal().is_halted() {
      status = StageStatus::Stopped;
    }

    ctx.close_outputs();
    ctx.drain_inputs();
    stage.dispose().await;
    ctx.set_status(status);

    let counters = ctx.counters();
    event!(
      Level::INFO,
      status = ?status,
      rows_read = counters.rows_read,
      rows_written = counters.rows_written,
      rows_rejected = counters.rows_rejected,
      "Stage copy ended."
    );
    ctx.hooks().fire_stage_finished(&counters);

    CopyOutcome {
      nested: ctx.take_nested(),
    }
  }
}
