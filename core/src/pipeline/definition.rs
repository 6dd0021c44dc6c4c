// rowflow/src/pipeline/definition.rs

//! Contains the declarative `PipelineDefinition` (stage list, link list, cluster
//! metadata) and methods for its construction and structural modification.
//!
//! Definitions are plain data. Nothing is validated here; `PipelineGraph::build`
//! checks a definition as a whole and reports every problem at once.

use crate::core::schema::{FieldMeta, Schema};
use crate::core::value::ValueType;
use crate::pipeline::parameters::{ParameterDefinition, Setting};
use crate::pipeline::partition::PartitionSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A named, declarative description of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
  pub name: String,
  #[serde(default)]
  pub stages: Vec<StageDefinition>,
  #[serde(default)]
  pub links: Vec<LinkDefinition>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cluster: Option<ClusterSpec>,
  /// Named parameters referenced as `${NAME}` in stage configs and error thresholds.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<ParameterDefinition>,
}

impl PipelineDefinition {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      stages: Vec::new(),
      links: Vec::new(),
      cluster: None,
      parameters: Vec::new(),
    }
  }

  /// Builder-style `add_stage`.
  pub fn stage(mut self, stage: StageDefinition) -> Self {
    self.add_stage(stage);
    self
  }

  /// Builder-style `add_link` with `LinkKind::Auto`.
  pub fn link(mut self, from: &str, to: &str) -> Self {
    self.add_link(LinkDefinition::new(from, to));
    self
  }

  pub fn link_with(mut self, from: &str, to: &str, kind: LinkKind) -> Self {
    self.add_link(LinkDefinition::new(from, to).with_kind(kind));
    self
  }

  pub fn with_cluster(mut self, cluster: ClusterSpec) -> Self {
    self.cluster = Some(cluster);
    self
  }

  /// Declares a parameter, replacing an earlier declaration of the same name.
  pub fn parameter(mut self, parameter: ParameterDefinition) -> Self {
    self.parameters.retain(|p| p.name != parameter.name);
    self.parameters.push(parameter);
    self
  }

  pub fn add_stage(&mut self, stage: StageDefinition) {
    self.stages.push(stage);
  }

  pub fn add_link(&mut self, link: LinkDefinition) {
    self.links.push(link);
  }

  pub fn stage_named(&self, name: &str) -> Option<&StageDefinition> {
    self.stages.iter().find(|s| s.name == name)
  }

  pub fn stage_named_mut(&mut self, name: &str) -> Option<&mut StageDefinition> {
    self.stages.iter_mut().find(|s| s.name == name)
  }

  /// Removes a stage together with every link touching it. Returns the removed stage.
  pub fn remove_stage(&mut self, name: &str) -> Option<StageDefinition> {
    let idx = self.stages.iter().position(|s| s.name == name)?;
    self.links.retain(|l| l.from != name && l.to != name);
    Some(self.stages.remove(idx))
  }

  /// Splits the link `from -> to` by routing it through `stage`.
  ///
  /// Returns `false` (and leaves the definition untouched) when no such link exists.
  pub fn insert_between(&mut self, from: &str, to: &str, stage: StageDefinition) -> bool {
    let Some(idx) = self.links.iter().position(|l| l.from == from && l.to == to) else {
      return false;
    };
    let original = self.links.remove(idx);
    let name = stage.name.clone();
    self.stages.push(stage);
    self.links.push(LinkDefinition::new(from, &name).with_kind(original.kind));
    self.links.push(LinkDefinition::new(&name, to));
    true
  }

  /// Names of the stages linked directly downstream of `name`.
  pub fn targets_of(&self, name: &str) -> Vec<&str> {
    self
      .links
      .iter()
      .filter(|l| l.from == name)
      .map(|l| l.to.as_str())
      .collect()
  }
}

fn default_copies() -> usize {
  1
}

fn is_null(value: &JsonValue) -> bool {
  value.is_null()
}

/// One stage of a pipeline: which plugin, how configured, how replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
  pub name: String,
  pub plugin_id: String,
  /// Opaque configuration handed to the plugin on initialization.
  #[serde(default, skip_serializing_if = "is_null")]
  pub config: JsonValue,
  /// Number of unpartitioned copies. Ignored (must be 1 or equal) for partitioned stages.
  #[serde(default = "default_copies")]
  pub copies: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partitioning: Option<PartitionSpec>,
  #[serde(default)]
  pub distribution: Distribution,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_handling: Option<ErrorHandling>,
  /// Name of the cluster node this stage runs on. `None` runs it locally.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node: Option<String>,
}

impl StageDefinition {
  pub fn new(name: impl Into<String>, plugin_id: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      plugin_id: plugin_id.into(),
      config: JsonValue::Null,
      copies: 1,
      partitioning: None,
      distribution: Distribution::default(),
      error_handling: None,
      node: None,
    }
  }

  pub fn with_config(mut self, config: JsonValue) -> Self {
    self.config = config;
    self
  }

  pub fn with_copies(mut self, copies: usize) -> Self {
    self.copies = copies;
    self
  }

  pub fn partitioned(mut self, spec: PartitionSpec) -> Self {
    self.partitioning = Some(spec);
    self
  }

  pub fn copy_rows_to_all(mut self) -> Self {
    self.distribution = Distribution::CopyToAll;
    self
  }

  pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
    self.error_handling = Some(handling);
    self
  }

  pub fn on_node(mut self, node: impl Into<String>) -> Self {
    self.node = Some(node.into());
    self
  }

  /// Number of copies the graph builder will instantiate.
  pub fn resolved_copies(&self) -> usize {
    match &self.partitioning {
      Some(spec) => spec.partitions,
      None => self.copies,
    }
  }

  /// The `port` entry of the config blob, used by boundary plugins.
  pub fn port_name(&self) -> Option<&str> {
    self.config.get("port").and_then(JsonValue::as_str)
  }
}

/// How a stage with several target stages spreads its rows over them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
  /// Each row goes to one target stage, rotating.
  #[default]
  RoundRobin,
  /// Each row is cloned to every target stage.
  CopyToAll,
}

/// How the copies of two linked stages are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
  /// Copy-to-copy when both sides have the same number of copies and no
  /// repartitioning is needed, full fan-out otherwise.
  #[default]
  Auto,
  /// One queue per (upstream copy, downstream copy) pair.
  FullFanOut,
  /// One queue per upstream copy, feeding the downstream copy with the same index.
  CopyToCopy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDefinition {
  pub from: String,
  pub to: String,
  #[serde(default)]
  pub kind: LinkKind,
}

impl LinkDefinition {
  pub fn new(from: &str, to: &str) -> Self {
    Self {
      from: from.to_string(),
      to: to.to_string(),
      kind: LinkKind::Auto,
    }
  }

  pub fn with_kind(mut self, kind: LinkKind) -> Self {
    self.kind = kind;
    self
  }
}

/// Remote worker nodes a clustered pipeline may place stages on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
  pub nodes: Vec<NodeSpec>,
}

impl ClusterSpec {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn node(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
    self.nodes.push(NodeSpec {
      name: name.into(),
      address: address.into(),
    });
    self
  }

  pub fn address_of(&self, name: &str) -> Option<&str> {
    self.nodes.iter().find(|n| n.name == name).map(|n| n.address.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
  pub name: String,
  /// `host:port` of the node's row transport listener.
  pub address: String,
}

fn default_count_field() -> String {
  "error_count".to_string()
}

fn default_description_field() -> String {
  "error_description".to_string()
}

fn default_fields_field() -> String {
  "error_fields".to_string()
}

fn default_code_field() -> String {
  "error_code".to_string()
}

/// Routes a stage's rejected rows to an error sink stage instead of failing the run.
///
/// Rejected rows reach the sink with four fields appended: the error count, the
/// description, the offending field names and the error code. The optional
/// thresholds turn a flood of rejections back into a run-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandling {
  /// Name of the stage receiving rejected rows.
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_errors: Option<Setting<u64>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_percent_errors: Option<Setting<u8>>,
  /// Rows that must be read before `max_percent_errors` is evaluated.
  #[serde(default)]
  pub min_rows_for_percent: Setting<u64>,
  #[serde(default = "default_count_field")]
  pub count_field: String,
  #[serde(default = "default_description_field")]
  pub description_field: String,
  #[serde(default = "default_fields_field")]
  pub fields_field: String,
  #[serde(default = "default_code_field")]
  pub code_field: String,
}

impl ErrorHandling {
  pub fn to(target: impl Into<String>) -> Self {
    Self {
      target: target.into(),
      max_errors: None,
      max_percent_errors: None,
      min_rows_for_percent: Setting::Value(0),
      count_field: default_count_field(),
      description_field: default_description_field(),
      fields_field: default_fields_field(),
      code_field: default_code_field(),
    }
  }

  pub fn with_max_errors(mut self, max: u64) -> Self {
    self.max_errors = Some(Setting::Value(max));
    self
  }

  pub fn with_max_percent_errors(mut self, percent: u8, min_rows: u64) -> Self {
    self.max_percent_errors = Some(Setting::Value(percent));
    self.min_rows_for_percent = Setting::Value(min_rows);
    self
  }

  /// `max_errors` taken from text such as `"${MAX_REJECTS}"`, resolved when the graph is built.
  pub fn with_max_errors_expr(mut self, max: impl Into<String>) -> Self {
    self.max_errors = Some(Setting::Expression(max.into()));
    self
  }

  pub fn with_max_percent_errors_expr(mut self, percent: impl Into<String>, min_rows: impl Into<String>) -> Self {
    self.max_percent_errors = Some(Setting::Expression(percent.into()));
    self.min_rows_for_percent = Setting::Expression(min_rows.into());
    self
  }

  /// The schema of error rows derived from rows of `source`.
  pub fn error_schema(&self, source: &Schema) -> Schema {
    source.extend([
      FieldMeta::new(self.count_field.clone(), ValueType::Integer),
      FieldMeta::new(self.description_field.clone(), ValueType::String),
      FieldMeta::new(self.fields_field.clone(), ValueType::String),
      FieldMeta::new(self.code_field.clone(), ValueType::String),
    ])
  }

  /// True when `rejected` rows out of `read` exceed the configured thresholds.
  pub fn threshold_exceeded(&self, rejected: u64, read: u64) -> bool {
    if let Some(max) = self.max_errors.as_ref().and_then(Setting::value) {
      if rejected > max {
        return true;
      }
    }
    if let Some(percent) = self.max_percent_errors.as_ref().and_then(Setting::value) {
      let min_rows = self.min_rows_for_percent.value().unwrap_or(0);
      if read > 0 && read >= min_rows && rejected * 100 > u64::from(percent) * read {
        return true;
      }
    }
    false
  }
}
