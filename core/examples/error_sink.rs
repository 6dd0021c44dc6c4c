// rowflow/examples/error_sink.rs

use async_trait::async_trait;
use rowflow::{
  EngineContext, ErrorHandling, FlowResult, InitContext, PipelineDefinition, RowFailure, Runner, Schema, Stage,
  StageContext, StageControl, StageDefinition, StageRegistry, Value,
};
use serde_json::json;
use tracing::{info, warn};

/// Rejects rows whose `amount` is negative or missing.
#[derive(Debug, Default)]
struct ValidateAmount;

#[async_trait]
impl Stage for ValidateAmount {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    match row.get_by_name("amount").and_then(Value::as_integer) {
      Some(amount) if amount >= 0 => ctx.emit_row(row).await?,
      Some(amount) => {
        let message = format!("negative amount {}", amount);
        return Err(RowFailure::new(row, "NEG", message).on_fields(["amount"]).into());
      }
      None => {
        return Err(RowFailure::new(row, "MISSING", "amount is missing").on_fields(["amount"]).into());
      }
    }
    Ok(StageControl::Continue)
  }
}

/// Logs every row it receives.
#[derive(Debug, Default)]
struct LogRows;

#[async_trait]
impl Stage for LogRows {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    let fields: Vec<String> = row
      .schema()
      .fields()
      .iter()
      .zip(row.values())
      .map(|(field, value)| format!("{}={:?}", field.name, value))
      .collect();
    warn!(stage = ctx.stage_name(), row = %fields.join(", "), "Row.");
    Ok(StageControl::Continue)
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
  info!("--- Error Sink Example ---");

  let registry = StageRegistry::with_builtins();
  registry.register_stage::<ValidateAmount>("validate-amount");
  registry.register_stage::<LogRows>("log-rows");

  // Rejected rows go to `rejects` with the error fields appended.
  // More than two rejections would fail the run.
  let definition = PipelineDefinition::new("payments")
    .stage(StageDefinition::new("payments", "generate-rows").with_config(json!({
      "fields": [
        { "name": "id", "value_type": "integer" },
        { "name": "amount", "value_type": "integer" }
      ],
      "rows": [[1, 120], [2, -5], [3, 40], [4, null], [5, 7]],
    })))
    .stage(
      StageDefinition::new("validate", "validate-amount")
        .with_error_handling(ErrorHandling::to("rejects").with_max_errors(2)),
    )
    .stage(StageDefinition::new("accepted", "dummy"))
    .stage(StageDefinition::new("rejects", "log-rows"))
    .link("payments", "validate")
    .link("validate", "accepted");

  let result = Runner::new(EngineContext::new(Default::default(), registry)).execute(&definition).await?;
  info!(
    status = ?result.status,
    accepted = result.totals("accepted").rows_read,
    rejected = result.rows_errored(),
    "Run finished."
  );
  Ok(())
}
