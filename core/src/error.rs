// rowflow/src/error.rs

//! Error taxonomy of the engine.
//!
//! `FlowError` covers every failure the engine itself can produce. Stage
//! implementations usually work with `anyhow` and let the `From` conversion
//! wrap their errors into `FlowError::Stage`. `ErrorDetail` is the clonable,
//! serializable summary kept as a run's first error and sent over the wire.

use crate::core::row::Row;
use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("Pipeline '{pipeline}' is invalid: {}", .problems.join("; "))]
  Structural { pipeline: String, problems: Vec<String> },

  #[error("Unknown stage plugin: {plugin_id}")]
  UnknownPlugin { plugin_id: String },

  #[error("Port '{port}' was not bound within {timeout:?}")]
  BindTimeout { port: String, timeout: Duration },

  #[error("Port '{port}' is already bound")]
  PortAlreadyBound { port: String },

  #[error("Stage copy '{copy}' failed to initialize. Source: {source}")]
  Initialization {
    copy: String,
    #[source]
    source: Box<FlowError>,
  },

  #[error("Invalid configuration for stage '{stage}': {message}")]
  Config { stage: String, message: String },

  #[error("{0}")]
  RowRejected(Box<RowFailure>),

  #[error("Stage copy '{copy}' rejected {rejected} rows, exceeding its error threshold")]
  TooManyRejected { copy: String, rejected: u64 },

  #[error("Partition key '{field}' is missing from the row schema")]
  PartitionKey { field: String },

  #[error("Schema mismatch on {location}: {message}")]
  SchemaMismatch { location: String, message: String },

  #[error("Error in stage implementation. Source: {source}")]
  Stage {
    #[source]
    source: AnyhowError,
  },

  #[error("Nested pipeline '{pipeline}' failed: {detail}")]
  SubPipeline { pipeline: String, detail: ErrorDetail },

  #[error("Remote node '{node}' reported failure: {detail}")]
  Remote { node: String, detail: ErrorDetail },

  #[error("Transport failure with '{peer}': {message}")]
  Transport { peer: String, message: String },

  #[error("I/O error. Source: {source}")]
  Io {
    #[from]
    source: std::io::Error,
  },

  #[error("Codec error. Source: {source}")]
  Codec {
    #[from]
    source: serde_json::Error,
  },

  #[error("Run was stopped")]
  Stopped,

  #[error("Internal rowflow error: {0}")]
  Internal(String),
}

impl FlowError {
  /// Classifies the error into the engine's failure taxonomy.
  pub fn kind(&self) -> ErrorKind {
    match self {
      FlowError::Structural { .. }
      | FlowError::UnknownPlugin { .. }
      | FlowError::BindTimeout { .. }
      | FlowError::PortAlreadyBound { .. } => ErrorKind::Structural,
      FlowError::Initialization { .. } | FlowError::Config { .. } => ErrorKind::Initialization,
      FlowError::RowRejected(_)
      | FlowError::TooManyRejected { .. }
      | FlowError::PartitionKey { .. }
      | FlowError::SchemaMismatch { .. } => ErrorKind::Row,
      FlowError::Transport { .. } | FlowError::Io { .. } | FlowError::Codec { .. } => ErrorKind::Transport,
      FlowError::Stage { .. }
      | FlowError::SubPipeline { .. }
      | FlowError::Remote { .. }
      | FlowError::Stopped
      | FlowError::Internal(_) => ErrorKind::Run,
    }
  }

  pub(crate) fn config(stage: impl Into<String>, message: impl fmt::Display) -> Self {
    FlowError::Config {
      stage: stage.into(),
      message: message.to_string(),
    }
  }

  pub(crate) fn transport(peer: impl Into<String>, message: impl fmt::Display) -> Self {
    FlowError::Transport {
      peer: peer.into(),
      message: message.to_string(),
    }
  }
}

// Stage code returns anyhow errors; unwrap them back into FlowError when they
// already carry one so the classification survives the round trip.
impl From<AnyhowError> for FlowError {
  fn from(err: AnyhowError) -> Self {
    match err.downcast::<FlowError>() {
      Ok(flow_err) => flow_err,
      Err(err) => FlowError::Stage { source: err },
    }
  }
}

impl From<RowFailure> for FlowError {
  fn from(failure: RowFailure) -> Self {
    FlowError::RowRejected(Box::new(failure))
  }
}

pub type FlowResult<T, E = FlowError> = std::result::Result<T, E>;

/// Failure classes reported in a run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Bad pipeline definition, rejected before any unit starts.
  Structural,
  /// A stage could not acquire its resources.
  Initialization,
  /// A single row failed and no error sink took it.
  Row,
  /// A stage or nested run failed.
  Run,
  /// A remote link broke or could not be established.
  Transport,
}

/// Clonable summary of a failure, kept as the first error of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
  pub stage: String,
  pub copy: usize,
  pub kind: ErrorKind,
  pub message: String,
}

impl ErrorDetail {
  pub fn new(stage: impl Into<String>, copy: usize, error: &FlowError) -> Self {
    Self {
      stage: stage.into(),
      copy,
      kind: error.kind(),
      message: error.to_string(),
    }
  }
}

impl fmt::Display for ErrorDetail {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{:?}] {}.{}: {}", self.kind, self.stage, self.copy, self.message)
  }
}

/// A row that failed processing, with the code and message routed to an error sink.
#[derive(Debug, Clone)]
pub struct RowFailure {
  pub row: Row,
  pub code: String,
  pub message: String,
  /// Names of the offending fields, if the stage knows them.
  pub fields: Vec<String>,
}

impl RowFailure {
  pub fn new(row: Row, code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      row,
      code: code.into(),
      message: message.into(),
      fields: Vec::new(),
    }
  }

  pub fn on_fields<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields = fields.into_iter().map(Into::into).collect();
    self
  }
}

impl fmt::Display for RowFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Row rejected [{}]: {}", self.code, self.message)
  }
}
