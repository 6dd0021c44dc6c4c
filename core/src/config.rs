// rowflow/src/config.rs

//! Engine-wide tuning knobs.
//!
//! `EngineConfig` travels inside the [`EngineContext`](crate::EngineContext) of a run.
//! Defaults suit local runs; every field can be overridden from `ROWFLOW_*`
//! environment variables with [`EngineConfig::from_env`].

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
pub const DEFAULT_INPUT_BLOCK_SIZE: usize = 500;
pub const DEFAULT_FEEDBACK_INTERVAL: u64 = 50_000;
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TRANSPORT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Capacity of every row queue allocated by the graph builder.
  pub queue_capacity: usize,
  /// Rows read from one input queue before a round-robin reader moves to the next.
  pub input_block_size: usize,
  /// Rows between two progress checkpoints of a copy. Zero disables checkpoints.
  pub feedback_interval: u64,
  /// Deadline for boundary ports and remote nodes to complete their bind handshake.
  pub bind_timeout_ms: u64,
  /// Deadline for opening a connection to a remote node.
  pub connect_timeout_ms: u64,
  /// Maximum rows per transport batch frame.
  pub transport_batch_size: usize,
  pub max_frame_bytes: usize,
  /// Verify that every queue carries a single row layout.
  pub safe_mode: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      input_block_size: DEFAULT_INPUT_BLOCK_SIZE,
      feedback_interval: DEFAULT_FEEDBACK_INTERVAL,
      bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
      connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
      transport_batch_size: DEFAULT_TRANSPORT_BATCH_SIZE,
      max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
      safe_mode: false,
    }
  }
}

impl EngineConfig {
  /// Loads the configuration from `ROWFLOW_*` environment variables, falling back
  /// to the defaults for unset ones.
  pub fn from_env() -> FlowResult<Self> {
    let defaults = Self::default();
    let config = Self {
      queue_capacity: env_or("ROWFLOW_QUEUE_CAPACITY", defaults.queue_capacity)?,
      input_block_size: env_or("ROWFLOW_INPUT_BLOCK_SIZE", defaults.input_block_size)?,
      feedback_interval: env_or("ROWFLOW_FEEDBACK_INTERVAL", defaults.feedback_interval)?,
      bind_timeout_ms: env_or("ROWFLOW_BIND_TIMEOUT_MS", defaults.bind_timeout_ms)?,
      connect_timeout_ms: env_or("ROWFLOW_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
      transport_batch_size: env_or("ROWFLOW_TRANSPORT_BATCH_SIZE", defaults.transport_batch_size)?,
      max_frame_bytes: env_or("ROWFLOW_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
      safe_mode: env_or("ROWFLOW_SAFE_MODE", defaults.safe_mode)?,
    };
    if config.queue_capacity == 0 {
      return Err(FlowError::config("engine", "ROWFLOW_QUEUE_CAPACITY must be positive"));
    }
    tracing::debug!(config = ?config, "Engine configuration loaded.");
    Ok(config)
  }

  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  pub fn with_input_block_size(mut self, rows: usize) -> Self {
    self.input_block_size = rows;
    self
  }

  pub fn with_feedback_interval(mut self, rows: u64) -> Self {
    self.feedback_interval = rows;
    self
  }

  pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
    self.bind_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn with_transport_batch_size(mut self, rows: usize) -> Self {
    self.transport_batch_size = rows;
    self
  }

  pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
    self.safe_mode = safe_mode;
    self
  }

  pub fn bind_timeout(&self) -> Duration {
    Duration::from_millis(self.bind_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}

fn env_or<T>(name: &str, default: T) -> FlowResult<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match env::var(name) {
    Ok(raw) => raw
      .trim()
      .parse::<T>()
      .map_err(|e| FlowError::config("engine", format!("Invalid {}: {}", name, e))),
    Err(_) => Ok(default),
  }
}
