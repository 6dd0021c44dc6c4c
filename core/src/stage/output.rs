// rowflow/src/stage/output.rs

//! Row dispatch from one copy to the input queues of its downstream copies.

use crate::core::queue::{PutOutcome, RowQueue};
use crate::core::row::Row;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::Distribution;
use crate::pipeline::partition::{PartitionMap, PartitionTarget};
use std::sync::Arc;

/// How rows are spread over the queues towards one target stage.
#[derive(Debug)]
pub(crate) enum Routing {
  /// Exactly one queue.
  Single,
  /// Rotate over the queues, one row each.
  RoundRobin { next: usize },
  /// Queue index = owning partition.
  Partitioned(Arc<PartitionMap>),
}

/// The queues of one copy towards one target stage.
#[derive(Debug)]
pub(crate) struct OutputGroup {
  target: Arc<str>,
  queues: Vec<Arc<RowQueue>>,
  routing: Routing,
}

impl OutputGroup {
  pub fn new(target: Arc<str>, queues: Vec<Arc<RowQueue>>, routing: Routing) -> Self {
    Self { target, queues, routing }
  }

  pub fn target(&self) -> &str {
    &self.target
  }

  pub fn queues(&self) -> &[Arc<RowQueue>] {
    &self.queues
  }

  /// Puts `row` on the queue(s) it belongs to. Returns the number of accepted puts.
  pub async fn send(&mut self, row: Row) -> FlowResult<u64> {
    if self.queues.is_empty() {
      return Ok(0);
    }
    let slot = match &mut self.routing {
      Routing::Single => 0,
      Routing::RoundRobin { next } => {
        let slot = *next % self.queues.len();
        *next = (slot + 1) % self.queues.len();
        slot
      }
      Routing::Partitioned(map) => match map.target(&row)? {
        PartitionTarget::One(partition) => partition,
        PartitionTarget::All => return send_to_all(&self.queues, row).await,
      },
    };
    let queue = self.queues.get(slot).ok_or_else(|| {
      FlowError::Internal(format!("no queue for slot {} towards '{}'", slot, self.target))
    })?;
    Ok(accepted(queue.put(row).await?))
  }

  pub fn close(&self) {
    for queue in &self.queues {
      queue.close();
    }
  }
}

fn accepted(outcome: PutOutcome) -> u64 {
  match outcome {
    PutOutcome::Accepted => 1,
    PutOutcome::Closed => 0,
  }
}

async fn send_to_all(queues: &[Arc<RowQueue>], row: Row) -> FlowResult<u64> {
  let mut count = 0;
  if let Some((last, rest)) = queues.split_last() {
    for queue in rest {
      count += accepted(queue.put(row.clone()).await?);
    }
    count += accepted(last.put(row).await?);
  }
  Ok(count)
}

/// All output groups of one copy plus its optional error sink group.
///
/// Dropping the router closes every queue it owns, so downstream copies always
/// observe end of input even when the owning unit unwinds.
#[derive(Debug)]
pub(crate) struct OutputRouter {
  groups: Vec<OutputGroup>,
  errors: Option<OutputGroup>,
  distribution: Distribution,
  next_group: usize,
}

impl OutputRouter {
  pub fn new(groups: Vec<OutputGroup>, errors: Option<OutputGroup>, distribution: Distribution) -> Self {
    Self {
      groups,
      errors,
      distribution,
      next_group: 0,
    }
  }

  pub fn has_error_sink(&self) -> bool {
    self.errors.is_some()
  }

  pub fn groups(&self) -> &[OutputGroup] {
    &self.groups
  }

  /// Sends a row according to the stage's distribution over its target stages.
  pub async fn route(&mut self, row: Row) -> FlowResult<u64> {
    match self.groups.len() {
      0 => Ok(0),
      1 => self.groups[0].send(row).await,
      count => match self.distribution {
        Distribution::RoundRobin => {
          let idx = self.next_group % count;
          self.next_group = (idx + 1) % count;
          self.groups[idx].send(row).await
        }
        Distribution::CopyToAll => {
          let mut sent = 0;
          let last = count - 1;
          for group in &mut self.groups[..last] {
            sent += group.send(row.clone()).await?;
          }
          sent += self.groups[last].send(row).await?;
          Ok(sent)
        }
      },
    }
  }

  /// Sends a row to one named target stage only.
  pub async fn route_to(&mut self, target: &str, row: Row) -> FlowResult<u64> {
    match self.groups.iter_mut().find(|g| g.target() == target) {
      Some(group) => group.send(row).await,
      None => Err(FlowError::Internal(format!("no output link to stage '{}'", target))),
    }
  }

  pub async fn route_error(&mut self, row: Row) -> FlowResult<u64> {
    match self.errors.as_mut() {
      Some(group) => group.send(row).await,
      None => Ok(0),
    }
  }

  /// Closes every output queue. Idempotent.
  pub fn close_all(&self) {
    for group in self.groups.iter().chain(self.errors.iter()) {
      group.close();
    }
  }
}

impl Drop for OutputRouter {
  fn drop(&mut self) {
    self.close_all();
  }
}
