// rowflow/examples/linear_pipeline.rs

use async_trait::async_trait;
use rowflow::{
  EngineConfig, EngineContext, FlowResult, InitContext, PipelineDefinition, RunHooks, Runner, Schema, Stage,
  StageContext, StageControl, StageDefinition, StageRegistry, Value,
};
use serde_json::json;
use tracing::info;

// 1. A custom stage: upper-cases the `name` field and passes everything else through.
#[derive(Debug, Default)]
struct Uppercase {
  name_index: usize,
}

#[async_trait]
impl Stage for Uppercase {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let schema = init.require_input_schema()?;
    self.name_index = schema.index_of("name").ok_or_else(|| rowflow::FlowError::Config {
      stage: init.stage_name().to_string(),
      message: "input has no 'name' field".to_string(),
    })?;
    Ok(schema.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    let mut values = row.into_values();
    if let Some(Value::String(name)) = values.get_mut(self.name_index) {
      *name = name.to_uppercase();
    }
    let row = ctx.new_row(values)?;
    info!(row = ?row.values(), "Uppercased.");
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
  info!("--- Linear Pipeline Example ---");

  // 2. Register the custom stage next to the built-ins.
  let registry = StageRegistry::with_builtins();
  registry.register_stage::<Uppercase>("uppercase");
  let engine = EngineContext::new(EngineConfig::default().with_feedback_interval(2), registry);

  // 3. generate-rows -> uppercase -> dummy
  let definition = PipelineDefinition::new("linear")
    .stage(StageDefinition::new("people", "generate-rows").with_config(json!({
      "fields": [
        { "name": "id", "value_type": "integer" },
        { "name": "name", "value_type": "string" }
      ],
      "rows": [[1, "ada"], [2, "grace"], [3, "edsger"], [4, "barbara"]],
    })))
    .stage(StageDefinition::new("shout", "uppercase"))
    .stage(StageDefinition::new("sink", "dummy"))
    .link("people", "shout")
    .link("shout", "sink");

  // 4. Watch progress through hooks.
  let hooks = RunHooks::new()
    .on_checkpoint(|checkpoint| {
      info!(
        stage = %checkpoint.stage,
        rows_read = checkpoint.rows_read,
        rows_written = checkpoint.rows_written,
        "Checkpoint."
      )
    })
    .on_stage_finished(|counters| info!(stage = %counters.stage, status = ?counters.status, "Stage finished."));

  let result = Runner::new(engine).with_hooks(hooks).execute(&definition).await?;
  info!(status = ?result.status, rows_in = result.rows_in(), rows_out = result.rows_out(), "Run finished.");
  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}
