// tests/parameter_tests.rs
mod common;

use async_trait::async_trait;
use common::*;
use rowflow::boundary::StaticPipelineProvider;
use rowflow::{
  EngineConfig, EngineContext, ErrorHandling, ErrorKind, FlowError, FlowResult, InitContext, ParameterDefinition,
  Parameters, PipelineDefinition, RunStatus, Runner, Schema, Setting, Stage, StageContext, StageControl,
  StageDefinition, Value,
};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;

/// A one-column string source whose cells may reference parameters.
fn names(name: &str, cells: &[&str]) -> StageDefinition {
  let rows: Vec<Vec<&str>> = cells.iter().map(|c| vec![*c]).collect();
  StageDefinition::new(name, "generate-rows").with_config(json!({
    "fields": [{ "name": "name", "value_type": "string" }],
    "rows": rows
  }))
}

fn names_of(harness: &Harness, stage: &str) -> Vec<String> {
  harness
    .rows_of(stage)
    .iter()
    .map(|row| row.get(0).and_then(Value::as_str).unwrap_or_default().to_string())
    .collect()
}

/// Emits `id` = 0.. up to the `ROWS` parameter.
#[derive(Debug, Default)]
struct CountFromParameter {
  rows: i64,
  next: i64,
}

#[async_trait]
impl Stage for CountFromParameter {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let raw = init.parameter("ROWS").unwrap_or("0");
    self.rows = raw.parse().map_err(|e: std::num::ParseIntError| FlowError::Config {
      stage: init.stage_name().to_string(),
      message: e.to_string(),
    })?;
    Ok(id_schema().as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    if self.next >= self.rows {
      return Ok(StageControl::Done);
    }
    let row = ctx.new_row(vec![Value::Integer(self.next)])?;
    self.next += 1;
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

#[test]
#[serial]
fn test_substitution_leaves_unknown_names_alone() {
  setup_tracing();
  let parameters = Parameters::new().set("DIR", "/data").set("N", "3");
  assert_eq!(parameters.substitute("${DIR}/in-${N}.csv"), "/data/in-3.csv");
  assert_eq!(parameters.substitute("${MISSING} and ${DIR"), "${MISSING} and ${DIR");

  let declared = vec![
    ParameterDefinition::new("A").with_default("1"),
    ParameterDefinition::new("B").with_default("2"),
    ParameterDefinition::new("C"),
  ];
  let merged = Parameters::merged(&declared, &Parameters::new().set("B", "20"));
  assert_eq!(merged.get("A"), Some("1"));
  assert_eq!(merged.get("B"), Some("20"));
  assert_eq!(merged.get("C"), None);
}

#[tokio::test]
#[serial]
async fn test_stage_configs_see_supplied_values_over_defaults() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("regional")
    .parameter(ParameterDefinition::new("REGION").with_default("eu"))
    .parameter(ParameterDefinition::new("TEAM").with_default("core"))
    .stage(names("read", &["${REGION}", "${TEAM}-${REGION}", "${UNSET}"]))
    .stage(collect("write"))
    .link("read", "write");

  let result = Runner::new(harness.engine()).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(names_of(&harness, "write"), vec!["eu", "core-eu", "${UNSET}"]);

  let harness = Harness::new();
  let engine = harness.engine().with_parameters(Parameters::new().set("REGION", "apac"));
  let result = Runner::new(engine).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(names_of(&harness, "write"), vec!["apac", "core-apac", "${UNSET}"]);
}

#[tokio::test]
#[serial]
async fn test_error_thresholds_read_parameters() {
  setup_tracing();
  let raw = json!({
    "name": "threshold",
    "parameters": [{ "name": "MAX_REJECTS", "default": "50" }],
    "stages": [
      { "name": "read", "plugin_id": SEQUENCE, "config": { "count": 100 } },
      {
        "name": "check",
        "plugin_id": REJECT_ODD,
        "error_handling": { "target": "rejects", "max_errors": "${MAX_REJECTS}" }
      },
      { "name": "good", "plugin_id": COLLECT },
      { "name": "rejects", "plugin_id": COLLECT }
    ],
    "links": [{ "from": "read", "to": "check" }, { "from": "check", "to": "good" }]
  });
  let definition: PipelineDefinition = serde_json::from_value(raw).unwrap();
  let handling = definition.stage_named("check").and_then(|s| s.error_handling.as_ref()).unwrap();
  assert_eq!(handling.max_errors, Some(Setting::Expression("${MAX_REJECTS}".into())));

  let harness = Harness::new();
  let result = Runner::new(harness.engine()).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(result.totals("check").rows_rejected, 50);

  let harness = Harness::new();
  let engine = harness.engine().with_parameters(Parameters::new().set("MAX_REJECTS", "2"));
  let result = Runner::new(engine).execute(&definition).await.unwrap();
  assert_eq!(result.status, RunStatus::Errored);
  assert_eq!(result.totals("check").rows_rejected, 3);
}

#[test]
#[serial]
fn test_threshold_that_does_not_resolve_to_a_number_is_structural() {
  setup_tracing();
  let harness = Harness::new();
  let definition = PipelineDefinition::new("unresolved")
    .stage(sequence("read", 10))
    .stage(reject_odd("check").with_error_handling(ErrorHandling::to("rejects").with_max_errors_expr("${NOPE}")))
    .stage(collect("good"))
    .stage(collect("rejects"))
    .link("read", "check")
    .link("check", "good");

  let err = Runner::new(harness.engine()).build(&definition).err().unwrap();
  assert_eq!(err.kind(), ErrorKind::Structural);
  assert!(err.to_string().contains("stage 'check': max_errors '${NOPE}'"), "{}", err);
}

#[tokio::test]
#[serial]
async fn test_stages_read_parameters_while_initializing() {
  setup_tracing();
  let harness = Harness::new();
  let registry = harness.registry();
  registry.register_stage::<CountFromParameter>("count-from-parameter");
  let engine = EngineContext::new(EngineConfig::default(), registry);

  let definition = PipelineDefinition::new("counted")
    .parameter(ParameterDefinition::new("ROWS").with_default("4"))
    .stage(StageDefinition::new("read", "count-from-parameter"))
    .stage(collect("write"))
    .link("read", "write");

  let result = Runner::new(engine).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(harness.ids_of("write"), vec![0, 1, 2, 3]);

  let harness_two = Harness::new();
  let registry = harness_two.registry();
  registry.register_stage::<CountFromParameter>("count-from-parameter");
  let engine = EngineContext::new(EngineConfig::default(), registry).with_parameters(Parameters::new().set("ROWS", "2"));
  let result = Runner::new(engine).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(harness_two.ids_of("write"), vec![0, 1]);
}

#[tokio::test]
#[serial]
async fn test_nested_runs_inherit_parameter_values() {
  setup_tracing();
  let harness = Harness::new();
  let nested = PipelineDefinition::new("labels")
    .parameter(ParameterDefinition::new("REGION").with_default("eu"))
    .stage(names("gen", &["${REGION}"]))
    .stage(StageDefinition::new("out", "output-port").with_config(json!({ "port": "output" })))
    .link("gen", "out");
  let registry = harness.registry();
  registry.register_sub_pipeline("labels", Arc::new(StaticPipelineProvider::new(nested)));
  let engine =
    EngineContext::new(EngineConfig::default(), registry).with_parameters(Parameters::new().set("REGION", "us"));

  let definition = PipelineDefinition::new("parent")
    .stage(StageDefinition::new("sub", "labels"))
    .stage(collect("write"))
    .link("sub", "write");

  let result = Runner::new(engine).execute(&definition).await.unwrap();
  assert!(result.is_success(), "{:?}", result.first_error);
  assert_eq!(names_of(&harness, "write"), vec!["us"]);
}
