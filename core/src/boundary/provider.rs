// rowflow/src/boundary/provider.rs

//! Defines the `PipelineProvider` trait and its implementations for sourcing the
//! definition of a nested pipeline.

use crate::core::context::InitContext;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::PipelineDefinition;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Supplies the definition a `SubPipelineStage` copy runs.
///
/// Called once per copy during initialization, so a provider may hand out a
/// different definition per copy or per configuration.
#[async_trait]
pub trait PipelineProvider: Send + Sync + 'static {
  async fn definition(&self, init: &InitContext) -> FlowResult<PipelineDefinition>;
}

// --- Static Pipeline Provider ---

/// Provides a pre-built definition.
#[derive(Debug, Clone)]
pub struct StaticPipelineProvider {
  definition: Arc<PipelineDefinition>,
}

impl StaticPipelineProvider {
  pub fn new(definition: PipelineDefinition) -> Self {
    Self {
      definition: Arc::new(definition),
    }
  }
}

#[async_trait]
impl PipelineProvider for StaticPipelineProvider {
  async fn definition(&self, _init: &InitContext) -> FlowResult<PipelineDefinition> {
    Ok(self.definition.as_ref().clone())
  }
}

// --- Functional Pipeline Provider ---

/// Provides a definition by invoking an asynchronous factory with the copy's
/// init context (cloned).
pub struct FunctionalPipelineProvider<F, Fut>
where
  F: Fn(InitContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FlowResult<PipelineDefinition>> + Send + 'static,
{
  factory: F,
}

impl<F, Fut> FunctionalPipelineProvider<F, Fut>
where
  F: Fn(InitContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FlowResult<PipelineDefinition>> + Send + 'static,
{
  pub fn new(factory: F) -> Self {
    Self { factory }
  }
}

#[async_trait]
impl<F, Fut> PipelineProvider for FunctionalPipelineProvider<F, Fut>
where
  F: Fn(InitContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = FlowResult<PipelineDefinition>> + Send + 'static,
{
  async fn definition(&self, init: &InitContext) -> FlowResult<PipelineDefinition> {
    let stage = init.stage_name().to_string();
    (self.factory)(init.clone()).await.map_err(|err| match err {
      FlowError::Config { .. } => err,
      other => FlowError::config(stage, format!("pipeline factory failed: {}", other)),
    })
  }
}

// --- Config Pipeline Provider ---

/// Reads the nested definition from the `definition` entry of the stage config.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigPipelineProvider;

#[async_trait]
impl PipelineProvider for ConfigPipelineProvider {
  async fn definition(&self, init: &InitContext) -> FlowResult<PipelineDefinition> {
    let raw = init
      .config_value()
      .get("definition")
      .cloned()
      .ok_or_else(|| FlowError::config(init.stage_name(), "missing nested pipeline 'definition'"))?;
    serde_json::from_value(raw).map_err(|e| FlowError::config(init.stage_name(), e))
  }
}
