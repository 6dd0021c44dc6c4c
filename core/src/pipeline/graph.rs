// rowflow/src/pipeline/graph.rs

//! Validates a `PipelineDefinition` and resolves it into copies and queues.
//!
//! Building a graph never starts anything. Every structural problem found in a
//! definition is collected and reported in one `FlowError::Structural`; only a
//! clean definition gets its copies resolved and its queues allocated.

use crate::boundary::{INPUT_PORT_PLUGIN, OUTPUT_PORT_PLUGIN};
use crate::core::context::{EngineContext, StageCopyId};
use crate::core::queue::RowQueue;
use crate::core::signal::RunSignal;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::{LinkKind, PipelineDefinition, StageDefinition};
use crate::pipeline::parameters::{Parameters, Setting};
use crate::pipeline::partition::{PartitionMap, PartitionMethod};
use crate::registry::StageFactory;
use crate::stage::output::{OutputGroup, Routing};
use crate::transport::remote::RemoteStageFactory;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{event, instrument, Level};

/// A stage after validation: its definition, resolved factory and copy range.
pub(crate) struct StagePlan {
  pub definition: Arc<StageDefinition>,
  pub factory: Arc<dyn StageFactory>,
  pub first_copy: usize,
  pub copies: usize,
  /// Stages feeding this one through regular links, in link order.
  pub upstream: Vec<usize>,
  /// Stages routing their rejected rows to this one.
  pub error_sources: Vec<usize>,
}

/// One copy with the queues it reads from and writes to.
pub(crate) struct CopyPlan {
  pub id: StageCopyId,
  pub stage: usize,
  pub inputs: Vec<Arc<RowQueue>>,
  pub readable: Arc<Notify>,
  pub writable: Arc<Notify>,
  pub outputs: Vec<OutputGroup>,
  pub errors: Option<OutputGroup>,
}

/// A graph taken apart by the runner.
pub(crate) struct GraphParts {
  pub name: String,
  pub signal: RunSignal,
  pub engine: EngineContext,
  pub parameters: Arc<Parameters>,
  pub stages: Vec<StagePlan>,
  pub copies: Vec<CopyPlan>,
  pub order: Vec<usize>,
}

/// A validated pipeline with every queue allocated, ready for `Runner::start`.
pub struct PipelineGraph {
  name: String,
  signal: RunSignal,
  engine: EngineContext,
  parameters: Arc<Parameters>,
  stages: Vec<StagePlan>,
  copies: Vec<CopyPlan>,
  /// Stage indexes in topological order.
  order: Vec<usize>,
  queue_count: usize,
}

fn is_port_plugin(plugin_id: &str) -> bool {
  plugin_id == INPUT_PORT_PLUGIN || plugin_id == OUTPUT_PORT_PLUGIN
}

/// Checks one definition and collects every problem.
struct Validator<'a> {
  definition: &'a PipelineDefinition,
  engine: &'a EngineContext,
  problems: Vec<String>,
  index: HashMap<&'a str, usize>,
}

impl<'a> Validator<'a> {
  fn new(definition: &'a PipelineDefinition, engine: &'a EngineContext) -> Self {
    Self {
      definition,
      engine,
      problems: Vec::new(),
      index: HashMap::new(),
    }
  }

  fn problem(&mut self, message: impl Into<String>) {
    self.problems.push(message.into());
  }

  fn check_stages(&mut self) {
    let definition = self.definition;
    if definition.stages.is_empty() {
      self.problem("pipeline has no stages");
    }
    for (idx, stage) in definition.stages.iter().enumerate() {
      if self.index.insert(stage.name.as_str(), idx).is_some() {
        self.problem(format!("duplicate stage name '{}'", stage.name));
      }
      self.check_replication(stage);
      self.check_placement(stage);
      if is_port_plugin(&stage.plugin_id) && stage.resolved_copies() > 1 {
        self.problem(format!("port stage '{}' must run a single copy", stage.name));
      }
    }
  }

  fn check_replication(&mut self, stage: &StageDefinition) {
    match &stage.partitioning {
      None => {
        if stage.copies == 0 {
          self.problem(format!("stage '{}' has zero copies", stage.name));
        }
      }
      Some(spec) => {
        if spec.partitions == 0 {
          self.problem(format!("stage '{}' is partitioned into zero partitions", stage.name));
        }
        if stage.copies != 1 && stage.copies != spec.partitions {
          self.problem(format!(
            "stage '{}' has {} copies but {} partitions",
            stage.name, stage.copies, spec.partitions
          ));
        }
        let missing_key = match &spec.method {
          PartitionMethod::Modulo { field } | PartitionMethod::Hash { field } => field.trim().is_empty(),
          PartitionMethod::Mirror => false,
        };
        if missing_key {
          self.problem(format!("stage '{}' is partitioned without a key field", stage.name));
        }
      }
    }
  }

  fn check_placement(&mut self, stage: &StageDefinition) {
    let definition = self.definition;
    match &stage.node {
      None => {
        if !self.engine.registry().contains(&stage.plugin_id) {
          self.problem(format!("stage '{}' uses unknown plugin '{}'", stage.name, stage.plugin_id));
        }
      }
      Some(node) => {
        match &definition.cluster {
          None => self.problem(format!(
            "stage '{}' is placed on node '{}' but the pipeline has no cluster",
            stage.name, node
          )),
          Some(cluster) if cluster.address_of(node).is_none() => {
            self.problem(format!("stage '{}' is placed on unknown node '{}'", stage.name, node))
          }
          Some(_) => {}
        }
        if stage.partitioning.is_some() {
          self.problem(format!("remote stage '{}' cannot be partitioned", stage.name));
        }
        if stage.error_handling.is_some() {
          self.problem(format!("remote stage '{}' cannot route rows to an error sink", stage.name));
        }
      }
    }
  }

  fn check_links(&mut self) {
    let definition = self.definition;
    let mut seen = HashSet::new();
    for link in &definition.links {
      let from = self.index.get(link.from.as_str()).copied();
      let to = self.index.get(link.to.as_str()).copied();
      if from.is_none() {
        self.problem(format!("link source '{}' is not a declared stage", link.from));
      }
      if to.is_none() {
        self.problem(format!("link target '{}' is not a declared stage", link.to));
      }
      if link.from == link.to {
        self.problem(format!("stage '{}' links to itself", link.from));
        continue;
      }
      if !seen.insert((link.from.as_str(), link.to.as_str())) {
        self.problem(format!("duplicate link '{}' -> '{}'", link.from, link.to));
      }
      let (Some(from), Some(to)) = (from, to) else {
        continue;
      };
      if link.kind == LinkKind::CopyToCopy {
        let source = &definition.stages[from];
        let target = &definition.stages[to];
        if source.resolved_copies() != target.resolved_copies() {
          self.problem(format!(
            "copy-to-copy link '{}' -> '{}' joins {} copies to {}",
            link.from,
            link.to,
            source.resolved_copies(),
            target.resolved_copies()
          ));
        } else if target.partitioning.is_some() && source.partitioning != target.partitioning {
          self.problem(format!(
            "copy-to-copy link '{}' -> '{}' feeds a partitioned stage from a differently partitioned one",
            link.from, link.to
          ));
        }
      }
    }
  }

  fn check_error_handling(&mut self) {
    let definition = self.definition;
    for stage in &definition.stages {
      let Some(handling) = &stage.error_handling else {
        continue;
      };
      if handling.target == stage.name {
        self.problem(format!("stage '{}' routes its errors to itself", stage.name));
      } else if !self.index.contains_key(handling.target.as_str()) {
        self.problem(format!(
          "error sink '{}' of stage '{}' is not a declared stage",
          handling.target, stage.name
        ));
      }
      if self
        .definition
        .links
        .iter()
        .any(|l| l.from == stage.name && l.to == handling.target)
      {
        self.problem(format!(
          "error sink '{}' of stage '{}' is also a regular link target",
          handling.target, stage.name
        ));
      }
      if handling
        .max_percent_errors
        .as_ref()
        .and_then(Setting::value)
        .is_some_and(|p| p > 100)
      {
        self.problem(format!("stage '{}' has an error percentage above 100", stage.name));
      }
    }
  }

  /// Topological order of the stage indexes over regular and error links.
  fn order(&mut self) -> Vec<usize> {
    let definition = self.definition;
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..definition.stages.len()).map(|i| graph.add_node(i)).collect();
    let edge = |from: &str, to: &str, graph: &mut DiGraph<usize, ()>| {
      if let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) {
        if a != b {
          graph.add_edge(nodes[a], nodes[b], ());
        }
      }
    };
    for link in &definition.links {
      edge(&link.from, &link.to, &mut graph);
    }
    for stage in &definition.stages {
      if let Some(handling) = &stage.error_handling {
        edge(&stage.name, &handling.target, &mut graph);
      }
    }
    match toposort(&graph, None) {
      Ok(sorted) => sorted.into_iter().map(|n| graph[n]).collect(),
      Err(cycle) => {
        let at = &definition.stages[graph[cycle.node_id()]].name;
        self.problem(format!("links form a cycle through stage '{}'", at));
        Vec::new()
      }
    }
  }
}

impl PipelineGraph {
  /// Validates `definition` against `engine` and allocates every queue.
  #[instrument(name = "PipelineGraph::build", skip_all, fields(pipeline = %definition.name), err(Display))]
  pub fn build(definition: &PipelineDefinition, engine: &EngineContext) -> FlowResult<Self> {
    let parameters = Parameters::merged(&definition.parameters, engine.parameters());
    let (resolved, unresolved) = parameters.apply(definition);
    let definition = &resolved;

    let mut validator = Validator::new(definition, engine);
    validator.problems.extend(unresolved);
    validator.check_stages();
    validator.check_links();
    validator.check_error_handling();
    let order = validator.order();
    if !validator.problems.is_empty() {
      event!(Level::ERROR, problems = validator.problems.len(), "Pipeline definition rejected.");
      return Err(FlowError::Structural {
        pipeline: definition.name.clone(),
        problems: validator.problems,
      });
    }
    let index: HashMap<String, usize> = validator
      .index
      .iter()
      .map(|(name, idx)| (name.to_string(), *idx))
      .collect();

    let signal = RunSignal::new();
    let mut graph = Self {
      name: definition.name.clone(),
      signal,
      engine: engine.clone(),
      parameters: Arc::new(parameters),
      stages: Vec::with_capacity(definition.stages.len()),
      copies: Vec::new(),
      order,
      queue_count: 0,
    };
    graph.resolve_copies(definition)?;
    for link in &definition.links {
      graph.wire(index[&link.from], index[&link.to], link.kind, false);
    }
    for (source, stage) in definition.stages.iter().enumerate() {
      if let Some(handling) = &stage.error_handling {
        graph.wire(source, index[&handling.target], LinkKind::Auto, true);
      }
    }

    event!(
      Level::DEBUG,
      stages = graph.stages.len(),
      copies = graph.copies.len(),
      queues = graph.queue_count,
      "Pipeline graph built."
    );
    Ok(graph)
  }

  fn resolve_copies(&mut self, definition: &PipelineDefinition) -> FlowResult<()> {
    for (stage_idx, stage) in definition.stages.iter().enumerate() {
      let factory: Arc<dyn StageFactory> = match &stage.node {
        Some(node) => {
          let address = definition
            .cluster
            .as_ref()
            .and_then(|c| c.address_of(node))
            .ok_or_else(|| FlowError::Internal(format!("node '{}' vanished after validation", node)))?;
          Arc::new(RemoteStageFactory::new(node, address))
        }
        None => self.engine.registry().resolve(&stage.plugin_id)?,
      };
      let copies = stage.resolved_copies();
      let partitioned = stage.partitioning.is_some();
      let first_copy = self.copies.len();
      for copy in 0..copies {
        self.copies.push(CopyPlan {
          id: StageCopyId::new(&stage.name, copy, partitioned.then_some(copy)),
          stage: stage_idx,
          inputs: Vec::new(),
          readable: Arc::new(Notify::new()),
          writable: Arc::new(Notify::new()),
          outputs: Vec::new(),
          errors: None,
        });
      }
      self.stages.push(StagePlan {
        definition: Arc::new(stage.clone()),
        factory,
        first_copy,
        copies,
        upstream: Vec::new(),
        error_sources: Vec::new(),
      });
    }
    Ok(())
  }

  fn new_queue(&mut self, from: usize, to: usize) -> Arc<RowQueue> {
    let (capacity, safe_mode) = {
      let config = self.engine.config();
      (config.queue_capacity, config.safe_mode)
    };
    let label = format!("{} -> {}", self.copies[from].id, self.copies[to].id);
    self.queue_count += 1;
    Arc::new(
      RowQueue::wired(
        label,
        capacity,
        self.signal.clone(),
        self.copies[to].readable.clone(),
        self.copies[from].writable.clone(),
      )
      .with_safe_mode(safe_mode),
    )
  }

  /// Allocates the queues of one link and attaches them to both sides.
  fn wire(&mut self, source: usize, target: usize, kind: LinkKind, error_link: bool) {
    let (na, nb) = (self.stages[source].copies, self.stages[target].copies);
    let (a0, b0) = (self.stages[source].first_copy, self.stages[target].first_copy);
    let source_spec = self.stages[source].definition.partitioning.clone();
    let target_spec = self.stages[target].definition.partitioning.clone();
    let target_name: Arc<str> = Arc::from(self.stages[target].definition.name.as_str());

    let repartition = target_spec.is_some() && source_spec != target_spec;
    let copy_to_copy = match kind {
      LinkKind::CopyToCopy => true,
      LinkKind::FullFanOut => false,
      LinkKind::Auto => na == nb && !repartition,
    };
    event!(
      Level::TRACE,
      source = %self.stages[source].definition.name,
      target = %target_name,
      copy_to_copy,
      error_link,
      "Wiring link."
    );

    let partition_map = target_spec.map(|spec| Arc::new(PartitionMap::new(spec)));
    for i in 0..na {
      let from = a0 + i;
      let group = if copy_to_copy {
        let to = b0 + i;
        let queue = self.new_queue(from, to);
        self.copies[to].inputs.push(queue.clone());
        OutputGroup::new(target_name.clone(), vec![queue], Routing::Single)
      } else {
        let mut queues = Vec::with_capacity(nb);
        for j in 0..nb {
          let to = b0 + j;
          let queue = self.new_queue(from, to);
          self.copies[to].inputs.push(queue.clone());
          queues.push(queue);
        }
        let routing = match &partition_map {
          Some(map) => Routing::Partitioned(map.clone()),
          None if nb > 1 => Routing::RoundRobin { next: i % nb },
          None => Routing::Single,
        };
        OutputGroup::new(target_name.clone(), queues, routing)
      };
      if error_link {
        self.copies[from].errors = Some(group);
      } else {
        self.copies[from].outputs.push(group);
      }
    }

    if error_link {
      self.stages[target].error_sources.push(source);
    } else {
      self.stages[target].upstream.push(source);
    }
  }

  pub(crate) fn into_parts(self) -> GraphParts {
    GraphParts {
      name: self.name,
      signal: self.signal,
      engine: self.engine,
      parameters: self.parameters,
      stages: self.stages,
      copies: self.copies,
      order: self.order,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// The signal shared by every queue and unit of the run this graph will become.
  pub fn signal(&self) -> &RunSignal {
    &self.signal
  }

  pub fn engine(&self) -> &EngineContext {
    &self.engine
  }

  pub fn copy_ids(&self) -> Vec<StageCopyId> {
    self.copies.iter().map(|c| c.id.clone()).collect()
  }

  pub fn copy_count(&self) -> usize {
    self.copies.len()
  }

  pub fn queue_count(&self) -> usize {
    self.queue_count
  }

  fn copy_plan(&self, stage: &str, copy: usize) -> Option<&CopyPlan> {
    self.copies.iter().find(|c| &*c.id.stage == stage && c.id.copy == copy)
  }

  /// Labels of the queues a copy reads from, in reading order.
  pub fn inputs_of(&self, stage: &str, copy: usize) -> Vec<String> {
    self
      .copy_plan(stage, copy)
      .map(|c| c.inputs.iter().map(|q| q.label().to_string()).collect())
      .unwrap_or_default()
  }

  /// Labels of the queues a copy writes to, error sink queues included.
  pub fn outputs_of(&self, stage: &str, copy: usize) -> Vec<String> {
    self
      .copy_plan(stage, copy)
      .map(|c| {
        c.outputs
          .iter()
          .chain(c.errors.iter())
          .flat_map(|g| g.queues().iter().map(|q| q.label().to_string()))
          .collect()
      })
      .unwrap_or_default()
  }
}
