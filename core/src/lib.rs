// rowflow/src/lib.rs

//! Rowflow: an async, row-oriented dataflow engine.
//!
//! A pipeline is a directed acyclic graph of named stages joined by bounded row
//! queues. Each stage may run as several parallel copies, rows can be partitioned
//! between copies by key, rejected rows can be diverted to an error sink, and a
//! stage may run a nested pipeline or run on another node of a cluster.
//!
//! Typical use:
//!  1. Register stage plugins in a `StageRegistry`.
//!  2. Describe the pipeline with a `PipelineDefinition`.
//!  3. `Runner::build` validates it into a `PipelineGraph`.
//!  4. `Runner::start` initializes every stage copy and returns a `RunHandle` to
//!     pause, resume, stop or await the run's `RunResult`.

pub mod boundary;
pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod stage;
pub mod transport;

// --- Re-exports for the Public API ---

pub use crate::config::EngineConfig;
pub use crate::core::{
  EngineContext, FieldMeta, InitContext, PutOutcome, Row, RowQueue, RunSignal, RunState, RunStatus, Schema,
  StageControl, StageCopyId, StageStatus, TryGet, TryPut, Value, ValueType,
};
pub use crate::error::{ErrorDetail, ErrorKind, FlowError, FlowResult, RowFailure};
pub use crate::pipeline::definition::{
  ClusterSpec, Distribution, ErrorHandling, LinkDefinition, LinkKind, NodeSpec, StageDefinition,
};
pub use crate::pipeline::hooks::RunHooks;
pub use crate::pipeline::parameters::{ParameterDefinition, Parameters, Setting};
pub use crate::pipeline::partition::{PartitionMethod, PartitionSpec};
pub use crate::pipeline::result::{NestedResult, RunResult, StageTotals};
pub use crate::pipeline::{PipelineDefinition, PipelineGraph, RunController, RunHandle, Runner};
pub use crate::registry::{StageFactory, StageRegistry};
pub use crate::stage::{Checkpoint, InputStrategy, Stage, StageContext, StageCounters};
pub use crate::transport::{NodeHandle, NodeServer};
