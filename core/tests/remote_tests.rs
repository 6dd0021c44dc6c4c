// tests/remote_tests.rs
mod common;

use common::*;
use rowflow::transport::frame::{Frame, FrameReader, FrameWriter};
use parking_lot::Mutex;
use rowflow::{
  Checkpoint, ClusterSpec, EngineConfig, EngineContext, ErrorKind, FlowError, NodeHandle, NodeServer,
  PipelineDefinition, RunHooks, RunStatus, Runner, StageDefinition, StageRegistry, Value,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

fn test_config() -> EngineConfig {
  EngineConfig::default()
    .with_bind_timeout(Duration::from_secs(2))
    .with_connect_timeout(Duration::from_secs(2))
    .with_transport_batch_size(7)
}

async fn spawn_node(engine: EngineContext) -> NodeHandle {
  NodeServer::bind("127.0.0.1:0", engine).await.unwrap().spawn().unwrap()
}

fn cluster(node: &NodeHandle) -> ClusterSpec {
  ClusterSpec::new().node("w1", node.local_addr().to_string())
}

#[tokio::test]
#[serial]
async fn test_remote_stage_round_trip_through_node() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("distributed")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 50))
    .stage(scale("work", 2).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let result = timeout(
    Duration::from_secs(10),
    Runner::new(harness.engine_with(test_config())).execute(&definition),
  )
  .await
  .expect("remote run must finish")
  .unwrap();

  assert_eq!(result.status, RunStatus::Success, "{:?}", result.first_error);
  assert_eq!(harness.ids_of("write"), (0..50).map(|i| i * 2).collect::<Vec<i64>>());
  assert_eq!(result.totals("work").rows_read, 50);
  let nested: Vec<_> = result.nested_of("work").collect();
  assert_eq!(nested.len(), 1);
  assert_eq!(nested[0].node.as_deref(), Some("w1"));
  assert_eq!(nested[0].result.status, RunStatus::Success);
  assert_eq!(nested[0].result.totals("work").rows_read, 50);
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_remote_source_streams_rows_back() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-source")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 30).on_node("w1"))
    .stage(collect("write"))
    .link("read", "write");

  let result = timeout(
    Duration::from_secs(10),
    Runner::new(harness.engine_with(test_config())).execute(&definition),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(harness.ids_of("write"), (0..30).collect::<Vec<i64>>());
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_remote_copies_each_submit_a_run() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-copies")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 40))
    .stage(scale("work", 3).on_node("w1").with_copies(2))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let result = timeout(
    Duration::from_secs(10),
    Runner::new(harness.engine_with(test_config())).execute(&definition),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(harness.sorted_ids_of("write"), (0..40).map(|i| i * 3).collect::<Vec<i64>>());
  assert_eq!(result.nested_of("work").count(), 2);
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_node_rejects_plugins_it_does_not_have() {
  setup_tracing();
  let node = spawn_node(EngineContext::new(test_config(), StageRegistry::with_builtins())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("missing-plugin")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 5))
    .stage(scale("work", 2).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let runner = Runner::new(harness.engine_with(test_config()));
  let err = runner.start(runner.build(&definition).unwrap()).await.unwrap_err();
  match err {
    FlowError::Initialization { copy, source } => {
      assert_eq!(copy, "work.0");
      match *source {
        FlowError::Remote { node, detail } => {
          assert_eq!(node, "w1");
          assert_eq!(detail.kind, ErrorKind::Initialization);
          assert!(detail.message.contains("test-scale"), "{}", detail.message);
        }
        other => panic!("expected a remote error, got {:?}", other),
      }
    }
    other => panic!("expected an initialization error, got {:?}", other),
  }
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_remote_failure_fails_the_supervisor_run() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-failure")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 1_000))
    .stage(fail_at("work", 3).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let result = timeout(
    Duration::from_secs(10),
    Runner::new(harness.engine_with(test_config())).execute(&definition),
  )
  .await
  .unwrap()
  .unwrap();

  assert_eq!(result.status, RunStatus::Errored);
  let error = result.first_error.unwrap();
  assert_eq!(error.stage, "work");
  assert_eq!(error.kind, ErrorKind::Run);
  assert!(error.message.contains("boom at row 3"), "{}", error.message);
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_stop_reaches_the_remote_run() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-stop")
    .with_cluster(cluster(&node))
    .stage(endless("read", 1))
    .stage(scale("work", 1).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let runner = Runner::new(harness.engine_with(test_config()));
  let handle = runner.start(runner.build(&definition).unwrap()).await.unwrap();
  sleep(Duration::from_millis(150)).await;
  handle.stop();

  let result = timeout(Duration::from_secs(10), handle.wait_done()).await.unwrap();
  assert_eq!(result.status, RunStatus::Stopped);
  assert!(result.first_error.is_none());
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_stop_is_prompt_when_the_node_is_backed_up() {
  setup_tracing();
  let backed_up = || {
    test_config()
      .with_bind_timeout(Duration::from_secs(5))
      .with_queue_capacity(4)
      .with_transport_batch_size(1)
  };
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(backed_up())).await;

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-backlog")
    .with_cluster(cluster(&node))
    .stage(endless("read", 0))
    .stage(slow_collect("work", 200).on_node("w1"))
    .link("read", "work");

  let runner = Runner::new(harness.engine_with(backed_up()));
  let handle = runner.start(runner.build(&definition).unwrap()).await.unwrap();
  sleep(Duration::from_secs(1)).await;

  let stop_requested = Instant::now();
  handle.stop();
  let result = timeout(Duration::from_secs(10), handle.wait_done()).await.unwrap();
  assert!(
    stop_requested.elapsed() < Duration::from_secs(2),
    "stop took {:?}",
    stop_requested.elapsed()
  );
  assert_eq!(result.status, RunStatus::Stopped);
  let nested: Vec<_> = result.nested_of("work").collect();
  assert_eq!(nested.len(), 1);
  assert_eq!(nested[0].result.status, RunStatus::Stopped);

  // The remote run is gone, not still working through its backlog.
  let collected = node_side.ids_of("work").len();
  sleep(Duration::from_millis(600)).await;
  assert_eq!(node_side.ids_of("work").len(), collected);
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_remote_checkpoints_reach_supervisor_hooks() {
  setup_tracing();
  let node_side = Harness::new();
  let node = spawn_node(node_side.engine_with(test_config().with_feedback_interval(10))).await;

  let seen: Arc<Mutex<Vec<Checkpoint>>> = Arc::default();
  let sink = seen.clone();
  let hooks = RunHooks::new().on_checkpoint(move |checkpoint| sink.lock().push(checkpoint.clone()));

  let harness = Harness::new();
  let definition = PipelineDefinition::new("remote-feedback")
    .with_cluster(cluster(&node))
    .stage(sequence("read", 50))
    .stage(scale("work", 2).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  // Local feedback off: every checkpoint seen here came from the node.
  let runner = Runner::new(harness.engine_with(test_config().with_feedback_interval(0))).with_hooks(hooks);
  let result = timeout(Duration::from_secs(10), runner.execute(&definition)).await.unwrap().unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);

  let seen = seen.lock();
  let work: Vec<&Checkpoint> = seen.iter().filter(|c| c.stage == "work").collect();
  assert_eq!(work.iter().map(|c| c.rows_read).collect::<Vec<_>>(), vec![10, 20, 30, 40, 50]);
  assert!(work.iter().all(|c| c.copy == 0));
  assert!(seen.iter().all(|c| c.stage == "work"));
  node.shutdown();
}

#[tokio::test]
#[serial]
async fn test_node_disconnect_fails_the_run_with_transport_error() {
  setup_tracing();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let fake_node = tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, "supervisor", 1 << 20);
    let mut writer = FrameWriter::new(write_half, "supervisor", 1 << 20);
    let submit = reader.next().await.unwrap().unwrap();
    assert!(matches!(submit, Frame::Submit { .. }));

    let schema = id_schema().as_ref().clone();
    writer
      .send(&Frame::Accepted {
        output_schema: Some(schema.clone()),
        run_id: 1,
      })
      .await
      .unwrap();
    writer.send(&Frame::Schema { version: 1, schema }).await.unwrap();
    writer
      .send(&Frame::Batch {
        version: 1,
        rows: vec![vec![Value::Integer(100)], vec![Value::Integer(101)]],
      })
      .await
      .unwrap();
    // Vanish mid-run.
  });

  let harness = Harness::new();
  let definition = PipelineDefinition::new("flaky")
    .with_cluster(ClusterSpec::new().node("w1", addr.to_string()))
    .stage(sequence("read", 1_000_000))
    .stage(scale("work", 1).on_node("w1"))
    .stage(collect("write"))
    .link("read", "work")
    .link("work", "write");

  let result = timeout(
    Duration::from_secs(10),
    Runner::new(harness.engine_with(test_config())).execute(&definition),
  )
  .await
  .expect("a lost node must fail the run promptly")
  .unwrap();
  fake_node.await.unwrap();

  assert_eq!(result.status, RunStatus::Errored);
  let error = result.first_error.unwrap();
  assert_eq!(error.stage, "work");
  assert_eq!(error.kind, ErrorKind::Transport);
  assert!(harness.ids_of("write").iter().all(|id| *id == 100 || *id == 101));
}

#[tokio::test]
#[serial]
async fn test_unreachable_node_fails_initialization() {
  setup_tracing();
  // Grab a free port and release it so nothing listens there.
  let addr = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let harness = Harness::new();
  let definition = PipelineDefinition::new("unreachable")
    .with_cluster(ClusterSpec::new().node("w1", addr.to_string()))
    .stage(sequence("read", 5))
    .stage(StageDefinition::new("work", SCALE).on_node("w1"))
    .link("read", "work");

  let runner = Runner::new(harness.engine_with(test_config()));
  let err = runner.start(runner.build(&definition).unwrap()).await.unwrap_err();
  match err {
    FlowError::Initialization { source, .. } => assert_eq!(source.kind(), ErrorKind::Transport),
    other => panic!("expected an initialization error, got {:?}", other),
  }
}
