// rowflow/src/pipeline/result.rs

//! The aggregated outcome of one pipeline run.

use crate::core::control::RunStatus;
use crate::error::ErrorDetail;
use crate::stage::metrics::StageCounters;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a caller gets back from `RunHandle::wait_done`, whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
  pub pipeline: String,
  pub status: RunStatus,
  /// One entry per copy, in graph order.
  pub stages: Vec<StageCounters>,
  pub elapsed: Duration,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub first_error: Option<ErrorDetail>,
  /// Results of sub-pipelines and remote runs started by this run's copies.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub nested: Vec<NestedResult>,
}

impl RunResult {
  pub fn is_success(&self) -> bool {
    self.status == RunStatus::Success
  }

  /// The counters of every copy of `stage`.
  pub fn copies_of<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a StageCounters> + 'a {
    self.stages.iter().filter(move |c| c.stage == stage)
  }

  /// Counters of `stage` summed over its copies.
  pub fn totals(&self, stage: &str) -> StageTotals {
    self.copies_of(stage).fold(StageTotals::default(), |mut acc, c| {
      acc.copies += 1;
      acc.rows_read += c.rows_read;
      acc.rows_written += c.rows_written;
      acc.rows_input += c.rows_input;
      acc.rows_output += c.rows_output;
      acc.rows_rejected += c.rows_rejected;
      acc.errors += c.errors;
      acc
    })
  }

  /// Rows read from external systems, over all copies.
  pub fn rows_in(&self) -> u64 {
    self.stages.iter().map(|c| c.rows_input).sum()
  }

  /// Rows written to external systems, over all copies.
  pub fn rows_out(&self) -> u64 {
    self.stages.iter().map(|c| c.rows_output).sum()
  }

  pub fn rows_errored(&self) -> u64 {
    self.stages.iter().map(|c| c.rows_rejected).sum()
  }

  pub fn nested_of(&self, stage: &str) -> impl Iterator<Item = &NestedResult> {
    let stage = stage.to_string();
    self.nested.iter().filter(move |n| n.stage == stage)
  }
}

/// Counters of one stage summed over its copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTotals {
  pub copies: usize,
  pub rows_read: u64,
  pub rows_written: u64,
  pub rows_input: u64,
  pub rows_output: u64,
  pub rows_rejected: u64,
  pub errors: u64,
}

/// The result of a run started on behalf of one copy of the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedResult {
  pub stage: String,
  pub copy: usize,
  /// The worker node that ran it, for remote stages.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node: Option<String>,
  pub result: RunResult,
}
