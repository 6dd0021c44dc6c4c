// rowflow/examples/partitioned.rs

use async_trait::async_trait;
use parking_lot::Mutex;
use rowflow::{
  EngineContext, FlowResult, InitContext, PartitionSpec, PipelineDefinition, Runner, Schema, Stage, StageContext,
  StageControl, StageDefinition, StageRegistry,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

type Seen = Arc<Mutex<BTreeMap<usize, Vec<String>>>>;

/// Sink remembering which city each copy received.
struct CitySink {
  seen: Seen,
}

#[async_trait]
impl Stage for CitySink {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    let city = row.get_by_name("city").and_then(|v| v.as_str()).unwrap_or("?").to_string();
    self.seen.lock().entry(ctx.id().copy).or_default().push(city);
    Ok(StageControl::Continue)
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
  info!("--- Partitioned Fan-out Example ---");

  let seen: Seen = Arc::default();
  let registry = StageRegistry::with_builtins();
  {
    let seen = seen.clone();
    registry.register("city-sink", move |_: &StageDefinition| -> FlowResult<Box<dyn Stage>> {
      Ok(Box::new(CitySink { seen: seen.clone() }))
    });
  }

  // Rows with the same city always land on the same copy of `by_city`.
  let definition = PipelineDefinition::new("partitioned")
    .stage(StageDefinition::new("orders", "generate-rows").with_config(json!({
      "fields": [
        { "name": "order", "value_type": "integer" },
        { "name": "city", "value_type": "string" }
      ],
      "rows": [[1, "Oslo"], [2, "Lima"], [3, "Oslo"], [4, "Pune"], [5, "Lima"], [6, "Oslo"]],
      "limit": 60,
    })))
    .stage(StageDefinition::new("by_city", "city-sink").partitioned(PartitionSpec::hash("city", 3)))
    .link("orders", "by_city");

  let result = Runner::new(EngineContext::new(Default::default(), registry)).execute(&definition).await?;
  info!(status = ?result.status, "Run finished.");

  for (copy, cities) in seen.lock().iter() {
    let mut distinct = cities.clone();
    distinct.sort();
    distinct.dedup();
    info!(copy, rows = cities.len(), cities = ?distinct, "Copy summary.");
  }
  for counters in result.copies_of("by_city") {
    info!(copy = counters.copy, partition = ?counters.partition, rows_read = counters.rows_read, "Counters.");
  }
  Ok(())
}
