// rowflow/src/core/context.rs

//! Explicit context objects handed to graph building and stage initialization.
//!
//! Nothing in the engine is process-global: the plugin registry, the port registry
//! of boundary stages and the configuration all travel in an `EngineContext` whose
//! lifetime is that of the runs using it.

use crate::boundary::ports::PortRegistry;
use crate::config::EngineConfig;
use crate::core::schema::Schema;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::StageDefinition;
use crate::pipeline::parameters::Parameters;
use crate::registry::StageRegistry;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared configuration, plugin registry and port bindings of one or more runs.
#[derive(Clone)]
pub struct EngineContext {
  config: Arc<EngineConfig>,
  registry: Arc<StageRegistry>,
  ports: PortRegistry,
  parameters: Arc<Parameters>,
}

impl EngineContext {
  pub fn new(config: EngineConfig, registry: StageRegistry) -> Self {
    Self {
      config: Arc::new(config),
      registry: Arc::new(registry),
      ports: PortRegistry::new(),
      parameters: Arc::new(Parameters::new()),
    }
  }

  /// Parameter values for runs built with this context. They override the
  /// defaults a definition declares.
  pub fn with_parameters(mut self, parameters: Parameters) -> Self {
    self.parameters = Arc::new(parameters);
    self
  }

  pub fn with_config(config: EngineConfig) -> Self {
    Self::new(config, StageRegistry::with_builtins())
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn registry(&self) -> &Arc<StageRegistry> {
    &self.registry
  }

  pub fn ports(&self) -> &PortRegistry {
    &self.ports
  }

  pub fn parameters(&self) -> &Parameters {
    &self.parameters
  }

  /// Same configuration and registry, fresh port bindings. Used for nested runs so
  /// their ports never collide with the parent's.
  pub fn scoped(&self) -> Self {
    Self {
      config: self.config.clone(),
      registry: self.registry.clone(),
      ports: PortRegistry::new(),
      parameters: self.parameters.clone(),
    }
  }
}

impl Default for EngineContext {
  fn default() -> Self {
    Self::new(EngineConfig::default(), StageRegistry::with_builtins())
  }
}

impl fmt::Debug for EngineContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EngineContext")
      .field("config", &self.config)
      .field("plugins", &self.registry.plugin_ids())
      .field("parameters", &self.parameters)
      .finish()
  }
}

/// Identity of one stage copy: stage name, copy index and owned partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageCopyId {
  pub stage: Arc<str>,
  pub copy: usize,
  pub partition: Option<usize>,
}

impl StageCopyId {
  pub fn new(stage: &str, copy: usize, partition: Option<usize>) -> Self {
    Self {
      stage: Arc::from(stage),
      copy,
      partition,
    }
  }
}

impl fmt::Display for StageCopyId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.partition {
      Some(p) => write!(f, "{}.{}[p{}]", self.stage, self.copy, p),
      None => write!(f, "{}.{}", self.stage, self.copy),
    }
  }
}

/// Everything a stage may look at while initializing.
#[derive(Clone)]
pub struct InitContext {
  pipeline: String,
  copy: StageCopyId,
  definition: Arc<StageDefinition>,
  input_schema: Option<Arc<Schema>>,
  engine: EngineContext,
  parameters: Arc<Parameters>,
}

impl InitContext {
  pub(crate) fn new(
    pipeline: &str,
    copy: StageCopyId,
    definition: Arc<StageDefinition>,
    input_schema: Option<Arc<Schema>>,
    engine: EngineContext,
    parameters: Arc<Parameters>,
  ) -> Self {
    Self {
      pipeline: pipeline.to_string(),
      copy,
      definition,
      input_schema,
      engine,
      parameters,
    }
  }

  /// The run's value for a named parameter: supplied, else the declared default.
  pub fn parameter(&self, name: &str) -> Option<&str> {
    self.parameters.get(name)
  }

  /// Every parameter value of the run.
  pub fn parameters(&self) -> &Parameters {
    &self.parameters
  }

  pub fn pipeline_name(&self) -> &str {
    &self.pipeline
  }

  pub fn copy(&self) -> &StageCopyId {
    &self.copy
  }

  pub fn stage_name(&self) -> &str {
    &self.definition.name
  }

  pub fn definition(&self) -> &StageDefinition {
    &self.definition
  }

  pub fn config_value(&self) -> &JsonValue {
    &self.definition.config
  }

  /// Deserializes the stage's config blob. A missing blob reads as an empty object.
  pub fn config<T: DeserializeOwned>(&self) -> FlowResult<T> {
    let raw = match &self.definition.config {
      JsonValue::Null => JsonValue::Object(Default::default()),
      other => other.clone(),
    };
    serde_json::from_value(raw).map_err(|e| FlowError::config(self.stage_name(), e))
  }

  pub fn input_schema(&self) -> Option<&Arc<Schema>> {
    self.input_schema.as_ref()
  }

  /// The input schema, or an error for stages that need an upstream.
  pub fn require_input_schema(&self) -> FlowResult<&Arc<Schema>> {
    self
      .input_schema
      .as_ref()
      .ok_or_else(|| FlowError::config(self.stage_name(), "stage requires an upstream stage"))
  }

  pub fn engine(&self) -> &EngineContext {
    &self.engine
  }
}

/// Handed to `Stage::bind` between initialization and the first row.
pub struct BindContext {
  ports: PortRegistry,
  deadline: Instant,
  timeout: Duration,
}

impl BindContext {
  pub(crate) fn new(ports: PortRegistry, timeout: Duration) -> Self {
    Self {
      ports,
      deadline: Instant::now() + timeout,
      timeout,
    }
  }

  pub fn ports(&self) -> &PortRegistry {
    &self.ports
  }

  /// Shared deadline of every handshake of the run.
  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }
}
