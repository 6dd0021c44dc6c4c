use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rowflow::{
  EngineConfig, EngineContext, PartitionSpec, PipelineDefinition, Row, RowQueue, RunSignal, Runner, Schema,
  StageDefinition, StageRegistry, Value, ValueType,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn generated(name: &str, rows: u64) -> StageDefinition {
  StageDefinition::new(name, "generate-rows").with_config(json!({
    "fields": [
      { "name": "id", "value_type": "integer" },
      { "name": "label", "value_type": "string" }
    ],
    "rows": [[1, "a"], [2, "b"], [3, "c"], [4, "d"]],
    "limit": rows,
  }))
}

fn engine(capacity: usize) -> EngineContext {
  EngineContext::new(
    EngineConfig::default().with_queue_capacity(capacity).with_feedback_interval(0),
    StageRegistry::with_builtins(),
  )
}

// --- Row queue hand-off between one producer and one consumer ---
fn bench_queue_handoff(c: &mut Criterion) {
  let mut group = c.benchmark_group("RowQueueHandoff");
  let rt = Runtime::new().unwrap();
  let schema = Arc::new(Schema::empty().field("id", ValueType::Integer));
  let rows: u64 = 10_000;
  group.throughput(Throughput::Elements(rows));

  for capacity in [1usize, 64, 1_000].iter() {
    group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
      b.to_async(&rt).iter_batched(
        || Arc::new(RowQueue::new("bench", capacity, RunSignal::new())),
        |queue| {
          let schema = schema.clone();
          async move {
            let producer = {
              let queue = queue.clone();
              tokio::spawn(async move {
                for id in 0..rows {
                  queue
                    .put(Row::new(schema.clone(), vec![Value::Integer(id as i64)]))
                    .await
                    .unwrap();
                }
                queue.close();
              })
            };
            let mut seen = 0u64;
            while queue.get().await.is_some() {
              seen += 1;
            }
            producer.await.unwrap();
            assert_eq!(seen, rows);
          }
        },
        criterion::BatchSize::SmallInput,
      );
    });
  }
  group.finish();
}

// --- Whole runs: generate -> dummy -> dummy ---
fn bench_linear_pipeline(c: &mut Criterion) {
  let mut group = c.benchmark_group("LinearPipeline");
  let rt = Runtime::new().unwrap();

  for rows in [1_000u64, 10_000].iter() {
    group.throughput(Throughput::Elements(*rows));
    let definition = PipelineDefinition::new("bench-linear")
      .stage(generated("gen", *rows))
      .stage(StageDefinition::new("pass", "dummy"))
      .stage(StageDefinition::new("sink", "dummy"))
      .link("gen", "pass")
      .link("pass", "sink");
    let runner = Runner::new(engine(1_000));

    group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
      b.to_async(&rt).iter(|| {
        let runner = &runner;
        let definition = &definition;
        async move {
          let result = runner.execute(definition).await.unwrap();
          assert!(result.is_success());
        }
      });
    });
  }
  group.finish();
}

// --- Partitioned fan-out to several copies ---
fn bench_partitioned_fan_out(c: &mut Criterion) {
  let mut group = c.benchmark_group("PartitionedFanOut");
  let rt = Runtime::new().unwrap();
  let rows: u64 = 10_000;
  group.throughput(Throughput::Elements(rows));

  for copies in [1usize, 4].iter() {
    let definition = PipelineDefinition::new("bench-partitioned")
      .stage(generated("gen", rows))
      .stage(StageDefinition::new("sink", "dummy").partitioned(PartitionSpec::hash("label", *copies)))
      .link("gen", "sink");
    let runner = Runner::new(engine(1_000));

    group.bench_with_input(BenchmarkId::from_parameter(copies), copies, |b, _| {
      b.to_async(&rt).iter(|| {
        let runner = &runner;
        let definition = &definition;
        async move {
          let result = runner.execute(definition).await.unwrap();
          assert!(result.is_success());
        }
      });
    });
  }
  group.finish();
}

criterion_group!(
  benches,
  bench_queue_handoff,
  bench_linear_pipeline,
  bench_partitioned_fan_out
);
criterion_main!(benches);
