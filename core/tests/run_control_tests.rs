// tests/run_control_tests.rs
mod common;

use common::*;
use parking_lot::Mutex;
use rowflow::{
  Checkpoint, EngineConfig, ErrorHandling, FlowError, PipelineDefinition, RunHandle, RunHooks, RunResult, RunState,
  RunStatus, Runner, StageCounters, StageDefinition, StageStatus,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn start(runner: &Runner, definition: &PipelineDefinition) -> RunHandle {
  let graph = runner.build(definition).unwrap();
  runner.start(graph).await.unwrap()
}

fn written_by(handle: &RunHandle, stage: &str) -> u64 {
  handle
    .counters()
    .iter()
    .filter(|c| c.stage == stage)
    .map(|c| c.rows_written)
    .sum()
}

#[tokio::test]
#[serial]
async fn test_stop_halts_an_endless_run() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("endless")
    .stage(endless("read", 1))
    .stage(collect("write"))
    .link("read", "write");
  let runner = Runner::new(harness.engine());
  let handle = start(&runner, &definition).await;
  let controller = handle.controller();
  assert_eq!(handle.state(), RunState::Running);

  sleep(Duration::from_millis(100)).await;
  handle.stop();
  let result = timeout(Duration::from_secs(5), handle.wait_done())
    .await
    .expect("stop must end the run");

  assert_eq!(result.status, RunStatus::Stopped);
  assert!(result.first_error.is_none());
  assert!(result.totals("read").rows_written > 0);
  assert!(result.stages.iter().all(|c| c.status.is_terminal()));
  assert_eq!(controller.state(), RunState::Stopped);
}

#[tokio::test]
#[serial]
async fn test_stop_reaches_stages_parked_on_full_queues() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("blocked")
    .stage(endless("read", 0))
    .stage(slow_collect("write", 1_000))
    .link("read", "write");
  let runner = Runner::new(harness.engine_with(EngineConfig::default().with_queue_capacity(2)));
  let handle = start(&runner, &definition).await;

  sleep(Duration::from_millis(50)).await;
  let controller = handle.controller();
  controller.stop();
  let result = timeout(Duration::from_secs(5), handle.wait_done())
    .await
    .expect("parked producers must notice the stop");
  assert_eq!(result.status, RunStatus::Stopped);
}

#[tokio::test]
#[serial]
async fn test_safe_stop_drains_rows_already_emitted() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("safe-stop")
    .stage(endless("read", 1))
    .stage(slow_collect("write", 2))
    .link("read", "write");
  let runner = Runner::new(harness.engine());
  let handle = start(&runner, &definition).await;

  sleep(Duration::from_millis(100)).await;
  handle.safe_stop();
  let result = timeout(Duration::from_secs(10), handle.wait_done()).await.unwrap();

  assert_eq!(result.status, RunStatus::Stopped);
  let written = result.totals("read").rows_written;
  assert!(written > 0);
  assert_eq!(result.totals("write").rows_read, written);
  assert_eq!(harness.ids_of("write").len() as u64, written);
  assert!(result.stages.iter().all(|c| c.status == StageStatus::Finished));
}

#[tokio::test]
#[serial]
async fn test_pause_holds_and_resume_continues() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("pausable")
    .stage(endless("read", 1))
    .stage(collect("write"))
    .link("read", "write");
  let runner = Runner::new(harness.engine());
  let handle = start(&runner, &definition).await;

  sleep(Duration::from_millis(50)).await;
  handle.pause();
  assert_eq!(handle.state(), RunState::Paused);
  sleep(Duration::from_millis(50)).await;
  let paused_at = written_by(&handle, "read");
  sleep(Duration::from_millis(150)).await;
  assert_eq!(written_by(&handle, "read"), paused_at, "no rows may flow while paused");

  handle.resume();
  assert_eq!(handle.state(), RunState::Running);
  sleep(Duration::from_millis(100)).await;
  assert!(written_by(&handle, "read") > paused_at);

  handle.stop();
  let result = timeout(Duration::from_secs(5), handle.wait_done()).await.unwrap();
  assert_eq!(result.status, RunStatus::Stopped);
}

#[tokio::test]
#[serial]
async fn test_stop_while_paused_ends_the_run() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("paused-stop")
    .stage(endless("read", 1))
    .stage(collect("write"))
    .link("read", "write");
  let runner = Runner::new(harness.engine());
  let handle = start(&runner, &definition).await;

  handle.pause();
  sleep(Duration::from_millis(30)).await;
  handle.stop();
  let result = timeout(Duration::from_secs(5), handle.wait_done()).await.unwrap();
  assert_eq!(result.status, RunStatus::Stopped);
}

#[tokio::test]
#[serial]
async fn test_initialization_failure_disposes_initialized_copies() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("init-failure")
    .stage(sequence("read", 10))
    .stage(StageDefinition::new("tracked", LIFECYCLE).with_copies(2))
    .stage(StageDefinition::new("broken", FAIL_INIT))
    .link("read", "tracked")
    .link("tracked", "broken");
  let runner = Runner::new(harness.engine());
  let graph = runner.build(&definition).unwrap();

  let err = runner.start(graph).await.unwrap_err();
  match &err {
    FlowError::Initialization { copy, source } => {
      assert_eq!(copy, "broken.0");
      assert!(source.to_string().contains("refuses to start"));
    }
    other => panic!("expected an initialization error, got {:?}", other),
  }
  assert_eq!(harness.initialized(), 2);
  assert_eq!(harness.disposed(), 2);
}

#[tokio::test]
#[serial]
async fn test_hooks_observe_start_checkpoints_and_finish() {
  setup_tracing();
  let harness = Harness::new();
  let started = Arc::new(Mutex::new(Vec::<String>::new()));
  let checkpoints = Arc::new(Mutex::new(Vec::<Checkpoint>::new()));
  let finished_copies = Arc::new(Mutex::new(Vec::<StageCounters>::new()));
  let results = Arc::new(Mutex::new(Vec::<RunResult>::new()));

  let hooks = {
    let (started, checkpoints) = (started.clone(), checkpoints.clone());
    let (finished_copies, results) = (finished_copies.clone(), results.clone());
    RunHooks::new()
      .on_start(move |name| started.lock().push(name.to_string()))
      .on_checkpoint(move |c| checkpoints.lock().push(c.clone()))
      .on_stage_finished(move |c| finished_copies.lock().push(c.clone()))
      .on_finish(move |r| results.lock().push(r.clone()))
  };
  let definition = PipelineDefinition::new("observed")
    .stage(sequence("read", 50))
    .stage(collect("write"))
    .link("read", "write");
  let engine = harness.engine_with(EngineConfig::default().with_feedback_interval(10));

  let result = Runner::new(engine).with_hooks(hooks).execute(&definition).await.unwrap();
  assert!(result.is_success());

  assert_eq!(*started.lock(), vec!["observed".to_string()]);
  let checkpoints = checkpoints.lock();
  let source: Vec<u64> = checkpoints.iter().filter(|c| c.stage == "read").map(|c| c.rows_written).collect();
  assert_eq!(source, vec![10, 20, 30, 40, 50]);
  let sink: Vec<u64> = checkpoints.iter().filter(|c| c.stage == "write").map(|c| c.rows_read).collect();
  assert_eq!(sink, vec![10, 20, 30, 40, 50]);
  assert_eq!(finished_copies.lock().len(), 2);
  let results = results.lock();
  assert_eq!(results.len(), 1);
  assert_eq!(results[0].status, RunStatus::Success);
}

#[tokio::test]
#[serial]
async fn test_row_listeners_see_reads_writes_and_error_rows() {
  setup_tracing();
  let harness = Harness::new();
  let read: Arc<Mutex<Vec<(String, i64)>>> = Arc::default();
  let written: Arc<Mutex<Vec<(String, i64)>>> = Arc::default();
  let errors: Arc<Mutex<Vec<(String, usize, i64, usize)>>> = Arc::default();
  let hooks = {
    let (read, written, errors) = (read.clone(), written.clone(), errors.clone());
    RunHooks::new()
      .on_row_read(move |copy, row| read.lock().push((copy.stage.to_string(), id_of(row))))
      .on_row_written(move |copy, row| written.lock().push((copy.stage.to_string(), id_of(row))))
      .on_error_row(move |copy, row| errors.lock().push((copy.stage.to_string(), copy.copy, id_of(row), row.len())))
  };
  let definition = PipelineDefinition::new("listened")
    .stage(sequence("read", 6))
    .stage(reject_odd("check").with_error_handling(ErrorHandling::to("bad")))
    .stage(collect("good"))
    .stage(collect("bad"))
    .link("read", "check")
    .link("check", "good");

  let result = Runner::new(harness.engine()).with_hooks(hooks).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);

  let by_stage = |seen: &[(String, i64)], stage: &str| -> Vec<i64> {
    seen.iter().filter(|(s, _)| s == stage).map(|(_, id)| *id).collect()
  };
  let read = read.lock();
  assert_eq!(by_stage(&read, "check"), vec![0, 1, 2, 3, 4, 5]);
  assert_eq!(by_stage(&read, "good"), vec![0, 2, 4]);
  assert_eq!(by_stage(&read, "bad"), vec![1, 3, 5]);
  let written = written.lock();
  assert_eq!(by_stage(&written, "read"), vec![0, 1, 2, 3, 4, 5]);
  assert_eq!(by_stage(&written, "check"), vec![0, 2, 4]);

  // Error rows carry the source fields plus the four error columns.
  let errors = errors.lock();
  assert_eq!(
    *errors,
    vec![
      ("check".to_string(), 0, 1, 5),
      ("check".to_string(), 0, 3, 5),
      ("check".to_string(), 0, 5, 5),
    ]
  );
}

#[tokio::test]
#[serial]
async fn test_run_result_serializes_to_json() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("serialized")
    .stage(sequence("read", 3))
    .stage(collect("write"))
    .link("read", "write");
  let result = Runner::new(harness.engine()).execute(&definition).await.unwrap();

  let json = serde_json::to_value(&result).unwrap();
  assert_eq!(json["pipeline"], "serialized");
  assert_eq!(json["status"], "success");
  let parsed: RunResult = serde_json::from_value(json).unwrap();
  assert_eq!(parsed.rows_out(), result.rows_out());
  assert_eq!(parsed.stages.len(), 2);
}
