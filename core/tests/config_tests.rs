// tests/config_tests.rs
mod common;

use common::*;
use rowflow::{EngineConfig, ErrorKind, FlowError};
use serial_test::serial;
use std::env;
use std::time::Duration;

const VARS: [&str; 8] = [
  "ROWFLOW_QUEUE_CAPACITY",
  "ROWFLOW_INPUT_BLOCK_SIZE",
  "ROWFLOW_FEEDBACK_INTERVAL",
  "ROWFLOW_BIND_TIMEOUT_MS",
  "ROWFLOW_CONNECT_TIMEOUT_MS",
  "ROWFLOW_TRANSPORT_BATCH_SIZE",
  "ROWFLOW_MAX_FRAME_BYTES",
  "ROWFLOW_SAFE_MODE",
];

fn clear_env() {
  for var in VARS {
    env::remove_var(var);
  }
}

#[test]
#[serial]
fn test_defaults_without_environment() {
  setup_tracing();
  clear_env();
  let config = EngineConfig::from_env().unwrap();
  assert_eq!(config, EngineConfig::default());
  assert_eq!(config.queue_capacity, 1_000);
  assert_eq!(config.input_block_size, 500);
  assert_eq!(config.feedback_interval, 50_000);
  assert_eq!(config.bind_timeout(), Duration::from_secs(30));
  assert_eq!(config.connect_timeout(), Duration::from_secs(10));
  assert!(!config.safe_mode);
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
  setup_tracing();
  clear_env();
  env::set_var("ROWFLOW_QUEUE_CAPACITY", "64");
  env::set_var("ROWFLOW_BIND_TIMEOUT_MS", " 250 ");
  env::set_var("ROWFLOW_SAFE_MODE", "true");
  env::set_var("ROWFLOW_TRANSPORT_BATCH_SIZE", "10");
  let config = EngineConfig::from_env();
  clear_env();

  let config = config.unwrap();
  assert_eq!(config.queue_capacity, 64);
  assert_eq!(config.bind_timeout(), Duration::from_millis(250));
  assert!(config.safe_mode);
  assert_eq!(config.transport_batch_size, 10);
  assert_eq!(config.input_block_size, 500);
}

#[test]
#[serial]
fn test_invalid_values_are_configuration_errors() {
  setup_tracing();
  clear_env();
  env::set_var("ROWFLOW_FEEDBACK_INTERVAL", "often");
  let err = EngineConfig::from_env().unwrap_err();
  clear_env();

  assert_eq!(err.kind(), ErrorKind::Initialization);
  match err {
    FlowError::Config { stage, message } => {
      assert_eq!(stage, "engine");
      assert!(message.starts_with("Invalid ROWFLOW_FEEDBACK_INTERVAL"), "{}", message);
    }
    other => panic!("expected a config error, got {:?}", other),
  }
}

#[test]
#[serial]
fn test_zero_queue_capacity_is_refused() {
  setup_tracing();
  clear_env();
  env::set_var("ROWFLOW_QUEUE_CAPACITY", "0");
  let result = EngineConfig::from_env();
  clear_env();
  assert!(matches!(result, Err(FlowError::Config { .. })));
}

#[test]
#[serial]
fn test_builders_override_fields() {
  setup_tracing();
  let config = EngineConfig::default()
    .with_queue_capacity(3)
    .with_input_block_size(2)
    .with_feedback_interval(10)
    .with_bind_timeout(Duration::from_millis(40))
    .with_connect_timeout(Duration::from_millis(50))
    .with_transport_batch_size(7)
    .with_safe_mode(true);
  assert_eq!(config.queue_capacity, 3);
  assert_eq!(config.input_block_size, 2);
  assert_eq!(config.feedback_interval, 10);
  assert_eq!(config.bind_timeout(), Duration::from_millis(40));
  assert_eq!(config.connect_timeout(), Duration::from_millis(50));
  assert_eq!(config.transport_batch_size, 7);
  assert!(config.safe_mode);
}
