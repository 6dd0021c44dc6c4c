// rowflow/src/boundary/mod.rs

//! Sub-pipeline boundaries: named ports through which rows enter and leave a
//! nested or remote run, and the stage that runs a nested pipeline.
//!
//! A port is late-bound. The side that owns a run (a parent `SubPipelineStage`
//! or a `NodeServer` connection) allocates the bridging queues and registers
//! them in the run's `PortRegistry` before starting it; the port stages pick
//! them up in `Stage::bind`.

pub mod inbound;
pub mod outbound;
pub mod ports;
pub mod provider;
pub mod subpipeline;

pub const INPUT_PORT_PLUGIN: &str = "input-port";
pub const OUTPUT_PORT_PLUGIN: &str = "output-port";
pub const SUB_PIPELINE_PLUGIN: &str = "sub-pipeline";

pub use inbound::InputPort;
pub use outbound::OutputPort;
pub use ports::{PortBinding, PortRegistry};
pub use provider::{ConfigPipelineProvider, FunctionalPipelineProvider, PipelineProvider, StaticPipelineProvider};
pub use subpipeline::SubPipelineStage;
