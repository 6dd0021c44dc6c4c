// rowflow/src/core/mod.rs

//! Data model and run-wide primitives: values, schemas, rows, row queues, the run
//! signal and the context objects handed to stages.

pub mod context;
pub mod control;
pub mod queue;
pub mod row;
pub mod schema;
pub mod signal;
pub mod value;

pub use context::{BindContext, EngineContext, InitContext, StageCopyId};
pub use control::{RunState, RunStatus, StageControl, StageStatus};
pub use queue::{PutOutcome, RowQueue, TryGet, TryPut};
pub use row::Row;
pub use schema::{FieldMeta, Schema};
pub use signal::{RunSignal, StopSignal};
pub use value::{Value, ValueType};
