// rowflow/src/core/control.rs

//! Defines signals for controlling stage flow and the status enums of copies and runs.

use serde::{Deserialize, Serialize};

/// Returned by `Stage::process_once` to tell the engine whether to call it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageControl {
  /// More work remains; the stage is invoked again.
  Continue,
  /// Input is exhausted or the generator is finished. Outputs are closed and the
  /// copy transitions to `Finished`.
  Done,
}

/// Lifecycle of one stage copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
  Created,
  Initialized,
  Running,
  Finished,
  Stopped,
  Errored,
}

impl StageStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, StageStatus::Finished | StageStatus::Stopped | StageStatus::Errored)
  }

  pub(crate) fn as_u8(self) -> u8 {
    self as u8
  }

  pub(crate) fn from_u8(raw: u8) -> Self {
    match raw {
      0 => StageStatus::Created,
      1 => StageStatus::Initialized,
      2 => StageStatus::Running,
      3 => StageStatus::Finished,
      4 => StageStatus::Stopped,
      _ => StageStatus::Errored,
    }
  }
}

/// Outcome of a full pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// Every copy finished cleanly.
  Success,
  /// The run was stopped from outside (stop or safe stop).
  Stopped,
  /// At least one copy errored.
  Errored,
}

/// Coarse state of a live run, as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  Initializing,
  Running,
  Paused,
  /// A stop or failure was signalled and units are winding down.
  Halting,
  Finished,
  FinishedWithErrors,
  Stopped,
}
