// tests/common/mod.rs
#![allow(dead_code)] // Not every test file uses every helper

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rowflow::{
  EngineConfig, EngineContext, FlowError, FlowResult, InitContext, Row, RowFailure, Schema, Stage, StageContext,
  StageControl, StageDefinition, StageRegistry, Value, ValueType,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

// --- Helper for Tracing Setup ---
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}

// --- Test plugin ids ---
pub const SEQUENCE: &str = "test-sequence";
pub const COLLECT: &str = "test-collect";
pub const SCALE: &str = "test-scale";
pub const FAIL_AT: &str = "test-fail-at";
pub const REJECT_ODD: &str = "test-reject-odd";
pub const FAIL_INIT: &str = "test-fail-init";
pub const LIFECYCLE: &str = "test-lifecycle";
pub const KEYED: &str = "test-keyed";

pub fn id_schema() -> Arc<Schema> {
  Arc::new(Schema::empty().field("id", ValueType::Integer))
}

pub fn id_row(schema: &Arc<Schema>, id: i64) -> Row {
  Row::new(schema.clone(), vec![Value::Integer(id)])
}

pub fn id_of(row: &Row) -> i64 {
  row.get(0).and_then(Value::as_integer).unwrap_or(-1)
}

// --- Stage definition shorthands ---
pub fn sequence(name: &str, count: u64) -> StageDefinition {
  StageDefinition::new(name, SEQUENCE).with_config(json!({ "count": count }))
}

/// A source that emits until stopped, pausing `delay_ms` between rows.
pub fn endless(name: &str, delay_ms: u64) -> StageDefinition {
  StageDefinition::new(name, SEQUENCE).with_config(json!({ "delay_ms": delay_ms }))
}

/// A source emitting `(key, seq)` rows, one per key in order, `seq` counting from 0.
pub fn keyed(name: &str, keys: &[i64]) -> StageDefinition {
  StageDefinition::new(name, KEYED).with_config(json!({ "keys": keys }))
}

pub fn collect(name: &str) -> StageDefinition {
  StageDefinition::new(name, COLLECT)
}

pub fn slow_collect(name: &str, delay_ms: u64) -> StageDefinition {
  StageDefinition::new(name, COLLECT).with_config(json!({ "delay_ms": delay_ms }))
}

pub fn scale(name: &str, factor: i64) -> StageDefinition {
  StageDefinition::new(name, SCALE).with_config(json!({ "factor": factor }))
}

pub fn fail_at(name: &str, at: i64) -> StageDefinition {
  StageDefinition::new(name, FAIL_AT).with_config(json!({ "at": at }))
}

pub fn reject_odd(name: &str) -> StageDefinition {
  StageDefinition::new(name, REJECT_ODD)
}

// --- Shared observations of the test plugins ---
#[derive(Debug, Clone)]
pub struct CollectedRow {
  pub stage: String,
  pub copy: usize,
  pub row: Row,
}

/// Registers the test plugins and records what they saw.
#[derive(Clone, Default)]
pub struct Harness {
  pub collected: Arc<Mutex<Vec<CollectedRow>>>,
  pub initialized: Arc<AtomicUsize>,
  pub disposed: Arc<AtomicUsize>,
}

impl Harness {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn registry(&self) -> StageRegistry {
    let registry = StageRegistry::with_builtins();
    registry.register_stage::<Sequence>(SEQUENCE);
    registry.register_stage::<Scale>(SCALE);
    registry.register_stage::<FailAt>(FAIL_AT);
    registry.register_stage::<RejectOdd>(REJECT_ODD);
    registry.register_stage::<FailInit>(FAIL_INIT);
    registry.register_stage::<Keyed>(KEYED);

    let collected = self.collected.clone();
    registry.register(COLLECT, move |_: &StageDefinition| -> FlowResult<Box<dyn Stage>> {
      Ok(Box::new(Collector::new(collected.clone())))
    });

    let (initialized, disposed) = (self.initialized.clone(), self.disposed.clone());
    registry.register(LIFECYCLE, move |_: &StageDefinition| -> FlowResult<Box<dyn Stage>> {
      Ok(Box::new(Lifecycle {
        initialized: initialized.clone(),
        disposed: disposed.clone(),
      }))
    });
    registry
  }

  pub fn engine(&self) -> EngineContext {
    self.engine_with(EngineConfig::default())
  }

  pub fn engine_with(&self, config: EngineConfig) -> EngineContext {
    EngineContext::new(config, self.registry())
  }

  /// Ids collected by `stage`, in arrival order.
  pub fn ids_of(&self, stage: &str) -> Vec<i64> {
    self
      .collected
      .lock()
      .iter()
      .filter(|c| c.stage == stage)
      .map(|c| id_of(&c.row))
      .collect()
  }

  /// Ids collected by one copy of `stage`, in arrival order.
  pub fn ids_of_copy(&self, stage: &str, copy: usize) -> Vec<i64> {
    self
      .collected
      .lock()
      .iter()
      .filter(|c| c.stage == stage && c.copy == copy)
      .map(|c| id_of(&c.row))
      .collect()
  }

  pub fn rows_of(&self, stage: &str) -> Vec<Row> {
    self
      .collected
      .lock()
      .iter()
      .filter(|c| c.stage == stage)
      .map(|c| c.row.clone())
      .collect()
  }

  pub fn rows_of_copy(&self, stage: &str, copy: usize) -> Vec<Row> {
    self
      .collected
      .lock()
      .iter()
      .filter(|c| c.stage == stage && c.copy == copy)
      .map(|c| c.row.clone())
      .collect()
  }

  pub fn sorted_ids_of(&self, stage: &str) -> Vec<i64> {
    let mut ids = self.ids_of(stage);
    ids.sort_unstable();
    ids
  }

  pub fn initialized(&self) -> usize {
    self.initialized.load(Ordering::SeqCst)
  }

  pub fn disposed(&self) -> usize {
    self.disposed.load(Ordering::SeqCst)
  }
}

// --- Test plugins ---

/// Emits `id` = 0, 1, 2, ... up to `count` rows, or forever without a count.
#[derive(Debug, Default)]
pub struct Sequence {
  count: Option<u64>,
  delay: Option<Duration>,
  next: u64,
}

#[derive(serde::Deserialize)]
struct SequenceConfig {
  #[serde(default)]
  count: Option<u64>,
  #[serde(default)]
  delay_ms: Option<u64>,
}

#[async_trait]
impl Stage for Sequence {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: SequenceConfig = init.config()?;
    self.count = config.count;
    self.delay = config.delay_ms.map(Duration::from_millis);
    Ok(id_schema().as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    if ctx.is_stop_requested() || self.count.is_some_and(|count| self.next >= count) {
      return Ok(StageControl::Done);
    }
    let row = ctx.new_row(vec![Value::Integer(self.next as i64)])?;
    self.next += 1;
    ctx.emit_row(row).await?;
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    Ok(StageControl::Continue)
  }
}

/// Emits `(key, seq)` for each configured key.
#[derive(Debug, Default)]
pub struct Keyed {
  keys: Vec<i64>,
  next: usize,
}

#[derive(serde::Deserialize)]
struct KeyedConfig {
  keys: Vec<i64>,
}

#[async_trait]
impl Stage for Keyed {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config: KeyedConfig = init.config()?;
    self.keys = config.keys;
    Ok(
      Schema::empty()
        .field("key", ValueType::Integer)
        .field("seq", ValueType::Integer),
    )
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(key) = self.keys.get(self.next).copied() else {
      return Ok(StageControl::Done);
    };
    let row = ctx.new_row(vec![Value::Integer(key), Value::Integer(self.next as i64)])?;
    self.next += 1;
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

/// Sink recording every row it reads.
pub struct Collector {
  collected: Arc<Mutex<Vec<CollectedRow>>>,
  delay: Option<Duration>,
}

impl Collector {
  pub fn new(collected: Arc<Mutex<Vec<CollectedRow>>>) -> Self {
    Self { collected, delay: None }
  }
}

#[async_trait]
impl Stage for Collector {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    self.delay = init
      .config_value()
      .get("delay_ms")
      .and_then(serde_json::Value::as_u64)
      .map(Duration::from_millis);
    Ok(init.input_schema().map(|s| s.as_ref().clone()).unwrap_or_default())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    self.collected.lock().push(CollectedRow {
      stage: ctx.stage_name().to_string(),
      copy: ctx.id().copy,
      row,
    });
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    Ok(StageControl::Continue)
  }
}

/// Multiplies `id` by `factor`.
#[derive(Debug, Default)]
pub struct Scale {
  factor: i64,
}

#[async_trait]
impl Stage for Scale {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    self.factor = init.config_value().get("factor").and_then(serde_json::Value::as_i64).unwrap_or(1);
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    let scaled = ctx.new_row(vec![Value::Integer(id_of(&row) * self.factor)])?;
    ctx.emit_row(scaled).await?;
    Ok(StageControl::Continue)
  }
}

/// Passes rows through and fails with a stage error on the row whose id is `at`.
#[derive(Debug, Default)]
pub struct FailAt {
  at: i64,
}

#[async_trait]
impl Stage for FailAt {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    self.at = init.config_value().get("at").and_then(serde_json::Value::as_i64).unwrap_or(0);
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    if id_of(&row) == self.at {
      return Err(anyhow::anyhow!("boom at row {}", self.at).into());
    }
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

/// Rejects rows with an odd id, passes even ones.
#[derive(Debug, Default)]
pub struct RejectOdd;

#[async_trait]
impl Stage for RejectOdd {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Ok(init.require_input_schema()?.as_ref().clone())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let Some(row) = ctx.get_row().await else {
      return Ok(StageControl::Done);
    };
    if id_of(&row) % 2 != 0 {
      let message = format!("odd id {}", id_of(&row));
      return Err(RowFailure::new(row, "ODD", message).on_fields(["id"]).into());
    }
    ctx.emit_row(row).await?;
    Ok(StageControl::Continue)
  }
}

/// Always fails to initialize.
#[derive(Debug, Default)]
pub struct FailInit;

#[async_trait]
impl Stage for FailInit {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    Err(FlowError::Stage {
      source: anyhow::anyhow!("{} refuses to start", init.stage_name()),
    })
  }

  async fn process_once(&mut self, _ctx: &mut StageContext) -> FlowResult<StageControl> {
    Ok(StageControl::Done)
  }
}

/// Pass-through counting initializations and disposals.
pub struct Lifecycle {
  initialized: Arc<AtomicUsize>,
  disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for Lifecycle {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    self.initialized.fetch_add(1, Ordering::SeqCst);
    Ok(init.input_schema().map(|s| s.as_ref().clone()).unwrap_or_default())
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    match ctx.get_row().await {
      Some(row) => {
        ctx.emit_row(row).await?;
        Ok(StageControl::Continue)
      }
      None => Ok(StageControl::Done),
    }
  }

  async fn dispose(&mut self) {
    self.disposed.fetch_add(1, Ordering::SeqCst);
  }
}
