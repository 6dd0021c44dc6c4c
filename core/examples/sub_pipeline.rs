// rowflow/examples/sub_pipeline.rs

use rowflow::boundary::provider::FunctionalPipelineProvider;
use rowflow::{EngineContext, InitContext, PipelineDefinition, Runner, StageDefinition, StageRegistry};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// `input-port -> dummy -> output-port`, named after the caller.
fn passthrough(name: &str) -> PipelineDefinition {
  PipelineDefinition::new(name)
    .stage(StageDefinition::new("in", "input-port").with_config(json!({ "port": "input" })))
    .stage(StageDefinition::new("work", "dummy"))
    .stage(StageDefinition::new("out", "output-port").with_config(json!({ "port": "output" })))
    .link("in", "work")
    .link("work", "out")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
  info!("--- Sub-pipeline Example ---");

  // 1. Nested definitions can be supplied inline, through the built-in `sub-pipeline` plugin...
  // 2. ...or built on demand by a provider registered under its own plugin id.
  let registry = StageRegistry::with_builtins();
  registry.register_sub_pipeline(
    "cleanse",
    Arc::new(FunctionalPipelineProvider::new(|init: InitContext| async move {
      Ok(passthrough(&format!("cleanse-for-{}", init.stage_name())))
    })),
  );

  let definition = PipelineDefinition::new("parent")
    .stage(StageDefinition::new("read", "generate-rows").with_config(json!({
      "fields": [{ "name": "id", "value_type": "integer" }],
      "rows": [[1], [2], [3]],
      "limit": 30,
    })))
    .stage(
      StageDefinition::new("inline", "sub-pipeline")
        .with_config(json!({ "definition": serde_json::to_value(passthrough("inline-nested"))? })),
    )
    .stage(StageDefinition::new("provided", "cleanse"))
    .stage(StageDefinition::new("sink", "dummy"))
    .link("read", "inline")
    .link("inline", "provided")
    .link("provided", "sink");

  let result = Runner::new(EngineContext::new(Default::default(), registry)).execute(&definition).await?;
  info!(status = ?result.status, rows = result.totals("sink").rows_read, "Parent finished.");
  for nested in &result.nested {
    info!(
      stage = %nested.stage,
      pipeline = %nested.result.pipeline,
      status = ?nested.result.status,
      "Nested run."
    );
  }
  Ok(())
}
