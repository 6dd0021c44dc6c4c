// rowflow/src/boundary/ports.rs

//! The late-binding table of named input and output ports.

use crate::core::queue::RowQueue;
use crate::core::schema::Schema;
use crate::error::{FlowError, FlowResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{event, Level};

/// A queue registered under a port name.
#[derive(Debug, Clone)]
pub struct PortBinding {
  pub queue: Arc<RowQueue>,
  /// Layout of the rows the binder will put (input ports) or expects (output ports).
  pub schema: Option<Arc<Schema>>,
  /// Who registered the binding, for diagnostics.
  pub peer: String,
}

impl PortBinding {
  pub fn new(queue: Arc<RowQueue>, peer: impl Into<String>) -> Self {
    Self {
      queue,
      schema: None,
      peer: peer.into(),
    }
  }

  pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
    self.schema = Some(schema);
    self
  }
}

#[derive(Debug, Default)]
struct PortTable {
  inputs: HashMap<String, PortBinding>,
  outputs: HashMap<String, PortBinding>,
  /// Port names ever bound; a name is never bound twice in one scope.
  bound_inputs: HashSet<String>,
  bound_outputs: HashSet<String>,
}

#[derive(Debug, Default)]
struct PortsInner {
  table: Mutex<PortTable>,
  changed: Notify,
}

/// Cloneable handle to the port table of one engine scope.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
  inner: Arc<PortsInner>,
}

#[derive(Clone, Copy)]
enum Side {
  Input,
  Output,
}

impl PortRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers the queue an input port will read from.
  pub fn bind_input(&self, port: &str, binding: PortBinding) -> FlowResult<()> {
    self.bind(Side::Input, port, binding)
  }

  /// Registers the queue an output port will write to.
  pub fn bind_output(&self, port: &str, binding: PortBinding) -> FlowResult<()> {
    self.bind(Side::Output, port, binding)
  }

  fn bind(&self, side: Side, port: &str, binding: PortBinding) -> FlowResult<()> {
    {
      let mut table = self.inner.table.lock();
      let table = &mut *table;
      let (slots, bound) = match side {
        Side::Input => (&mut table.inputs, &mut table.bound_inputs),
        Side::Output => (&mut table.outputs, &mut table.bound_outputs),
      };
      if !bound.insert(port.to_string()) {
        return Err(FlowError::PortAlreadyBound { port: port.to_string() });
      }
      event!(Level::DEBUG, port, peer = %binding.peer, "Port bound.");
      slots.insert(port.to_string(), binding);
    }
    self.inner.changed.notify_waiters();
    Ok(())
  }

  /// The schema announced by the binder of input port `port`, if bound yet.
  pub fn input_schema(&self, port: &str) -> Option<Arc<Schema>> {
    self.inner.table.lock().inputs.get(port).and_then(|b| b.schema.clone())
  }

  pub fn is_input_bound(&self, port: &str) -> bool {
    self.inner.table.lock().bound_inputs.contains(port)
  }

  pub fn is_output_bound(&self, port: &str) -> bool {
    self.inner.table.lock().bound_outputs.contains(port)
  }

  /// Takes the binding of input port `port`, waiting until `deadline`.
  pub async fn take_input(&self, port: &str, deadline: Instant, timeout: Duration) -> FlowResult<PortBinding> {
    self.take(Side::Input, port, deadline, timeout).await
  }

  /// Takes the binding of output port `port`, waiting until `deadline`.
  pub async fn take_output(&self, port: &str, deadline: Instant, timeout: Duration) -> FlowResult<PortBinding> {
    self.take(Side::Output, port, deadline, timeout).await
  }

  async fn take(&self, side: Side, port: &str, deadline: Instant, timeout: Duration) -> FlowResult<PortBinding> {
    loop {
      let notified = self.inner.changed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      {
        let mut table = self.inner.table.lock();
        let slots = match side {
          Side::Input => &mut table.inputs,
          Side::Output => &mut table.outputs,
        };
        if let Some(binding) = slots.remove(port) {
          return Ok(binding);
        }
      }

      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        event!(Level::ERROR, port, ?timeout, "Port was not bound in time.");
        return Err(FlowError::BindTimeout {
          port: port.to_string(),
          timeout,
        });
      }
    }
  }
}
