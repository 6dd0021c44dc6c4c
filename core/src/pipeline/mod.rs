// rowflow/src/pipeline/mod.rs

//! Declarative pipeline definitions, graph building and the runner.

pub mod definition;
pub(crate) mod execution;
pub mod graph;
pub mod hooks;
pub mod parameters;
pub mod partition;
pub mod result;
pub mod runner;

pub use definition::PipelineDefinition;
pub use graph::PipelineGraph;
pub use runner::{RunController, RunHandle, Runner};
