// rowflow/src/registry.rs

//! Defines `StageRegistry`, the plugin-id keyed catalog of stage factories.
//!
//! The graph builder resolves every local stage's plugin id here before anything
//! runs, so an unknown plugin is a structural error. A registry is an ordinary
//! value carried by the `EngineContext`; different engines (for example a worker
//! node and its supervisor) may hold different catalogs.

use crate::boundary::inbound::InputPort;
use crate::boundary::outbound::OutputPort;
use crate::boundary::provider::{ConfigPipelineProvider, PipelineProvider};
use crate::boundary::subpipeline::SubPipelineStage;
use crate::boundary::{INPUT_PORT_PLUGIN, OUTPUT_PORT_PLUGIN, SUB_PIPELINE_PLUGIN};
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::StageDefinition;
use crate::stage::builtin::{Dummy, GenerateRows, DUMMY_PLUGIN, GENERATE_ROWS_PLUGIN};
use crate::stage::Stage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

/// Creates a fresh stage instance for one copy.
pub trait StageFactory: Send + Sync {
  fn create(&self, definition: &StageDefinition) -> FlowResult<Box<dyn Stage>>;
}

impl<F> StageFactory for F
where
  F: Fn(&StageDefinition) -> FlowResult<Box<dyn Stage>> + Send + Sync,
{
  fn create(&self, definition: &StageDefinition) -> FlowResult<Box<dyn Stage>> {
    self(definition)
  }
}

pub struct StageRegistry {
  factories: RwLock<HashMap<String, Arc<dyn StageFactory>>>,
}

impl StageRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self {
      factories: RwLock::new(HashMap::new()),
    }
  }

  /// A registry holding the generic built-in stages and the boundary plugins.
  pub fn with_builtins() -> Self {
    let registry = Self::new();
    registry.register_stage::<GenerateRows>(GENERATE_ROWS_PLUGIN);
    registry.register_stage::<Dummy>(DUMMY_PLUGIN);
    registry.register_stage::<InputPort>(INPUT_PORT_PLUGIN);
    registry.register_stage::<OutputPort>(OUTPUT_PORT_PLUGIN);
    registry.register_sub_pipeline(SUB_PIPELINE_PLUGIN, Arc::new(ConfigPipelineProvider));
    registry
  }

  /// Registers (or replaces) the factory for `plugin_id`.
  pub fn register<F>(&self, plugin_id: &str, factory: F)
  where
    F: StageFactory + 'static,
  {
    event!(Level::DEBUG, plugin_id, "Registering stage plugin.");
    let previous = self.factories.write().insert(plugin_id.to_string(), Arc::new(factory));
    if previous.is_some() {
      event!(Level::WARN, plugin_id, "Stage plugin replaced an earlier registration.");
    }
  }

  /// Registers a stage type constructed through `Default`.
  pub fn register_stage<S>(&self, plugin_id: &str)
  where
    S: Stage + Default + 'static,
  {
    self.register(plugin_id, |_: &StageDefinition| -> FlowResult<Box<dyn Stage>> {
      Ok(Box::new(S::default()))
    });
  }

  /// Registers a sub-pipeline plugin whose nested definition comes from `provider`.
  pub fn register_sub_pipeline(&self, plugin_id: &str, provider: Arc<dyn PipelineProvider>) {
    self.register(plugin_id, move |_: &StageDefinition| -> FlowResult<Box<dyn Stage>> {
      Ok(Box::new(SubPipelineStage::new(provider.clone())))
    });
  }

  pub fn contains(&self, plugin_id: &str) -> bool {
    self.factories.read().contains_key(plugin_id)
  }

  /// Looks up the factory of `plugin_id`.
  pub fn resolve(&self, plugin_id: &str) -> FlowResult<Arc<dyn StageFactory>> {
    self.factories.read().get(plugin_id).cloned().ok_or_else(|| {
      event!(Level::ERROR, plugin_id, "No stage plugin registered.");
      FlowError::UnknownPlugin {
        plugin_id: plugin_id.to_string(),
      }
    })
  }

  /// Registered plugin ids, sorted.
  pub fn plugin_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
    ids.sort();
    ids
  }
}

impl Default for StageRegistry {
  fn default() -> Self {
    Self::new()
  }
}
