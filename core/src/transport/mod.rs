// rowflow/src/transport/mod.rs

//! Remote execution over TCP.
//!
//! A stage declared with a `node` runs on that cluster node: the supervisor side
//! (`RemoteStage`) submits a one-stage pipeline to the node's `NodeServer` and
//! streams rows both ways in length-prefixed JSON frames.

pub mod frame;
pub mod node;
pub mod remote;

pub use frame::{BatchDecoder, BatchEncoder, Frame, FrameReader, FrameWriter};
pub use node::{NodeHandle, NodeServer};
pub use remote::{RemoteStage, RemoteStageFactory};
