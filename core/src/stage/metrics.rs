// rowflow/src/stage/metrics.rs

//! Per-copy row counters and progress checkpoints.

use crate::core::context::StageCopyId;
use crate::core::control::StageStatus;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Live counters of one copy. Written only by the copy's own unit, read by the
/// run handle for status snapshots.
#[derive(Debug, Default)]
pub(crate) struct StageMetrics {
  rows_read: AtomicU64,
  rows_written: AtomicU64,
  rows_input: AtomicU64,
  rows_output: AtomicU64,
  rows_rejected: AtomicU64,
  errors: AtomicU64,
  status: AtomicU8,
}

impl StageMetrics {
  pub fn add_read(&self) -> u64 {
    self.rows_read.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn add_written(&self, rows: u64) -> u64 {
    self.rows_written.fetch_add(rows, Ordering::Relaxed) + rows
  }

  pub fn add_input(&self, rows: u64) {
    self.rows_input.fetch_add(rows, Ordering::Relaxed);
  }

  pub fn add_output(&self, rows: u64) {
    self.rows_output.fetch_add(rows, Ordering::Relaxed);
  }

  pub fn add_rejected(&self) -> u64 {
    self.rows_rejected.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn add_error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }

  pub fn rows_read(&self) -> u64 {
    self.rows_read.load(Ordering::Relaxed)
  }

  pub fn rows_written(&self) -> u64 {
    self.rows_written.load(Ordering::Relaxed)
  }

  pub fn status(&self) -> StageStatus {
    StageStatus::from_u8(self.status.load(Ordering::SeqCst))
  }

  pub fn set_status(&self, status: StageStatus) {
    self.status.store(status.as_u8(), Ordering::SeqCst);
  }

  pub fn snapshot(&self, id: &StageCopyId) -> StageCounters {
    StageCounters {
      stage: id.stage.to_string(),
      copy: id.copy,
      partition: id.partition,
      status: self.status(),
      rows_read: self.rows_read.load(Ordering::Relaxed),
      rows_written: self.rows_written.load(Ordering::Relaxed),
      rows_input: self.rows_input.load(Ordering::Relaxed),
      rows_output: self.rows_output.load(Ordering::Relaxed),
      rows_rejected: self.rows_rejected.load(Ordering::Relaxed),
      errors: self.errors.load(Ordering::Relaxed),
    }
  }
}

/// Counters of one copy at a point in time.
///
/// `rows_read`/`rows_written` count rows taken from / put on row queues;
/// `rows_input`/`rows_output` count rows exchanged with external systems as
/// reported by the stage itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
  pub stage: String,
  pub copy: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partition: Option<usize>,
  pub status: StageStatus,
  pub rows_read: u64,
  pub rows_written: u64,
  pub rows_input: u64,
  pub rows_output: u64,
  pub rows_rejected: u64,
  pub errors: u64,
}

/// Advisory progress report of one copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub stage: String,
  pub copy: usize,
  pub rows_read: u64,
  pub rows_written: u64,
}
