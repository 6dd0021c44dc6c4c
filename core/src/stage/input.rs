// rowflow/src/stage/input.rs

//! Multiplexed reading over the input queues of one copy.

use crate::core::queue::{RowQueue, TryGet};
use crate::core::row::Row;
use crate::core::signal::RunSignal;
use crate::stage::InputStrategy;
use std::sync::Arc;
use tokio::sync::Notify;

enum NextRow {
  Row(Row),
  Empty,
  Exhausted,
}

pub(crate) struct InputSet {
  /// Queues that may still deliver rows.
  open: Vec<Arc<RowQueue>>,
  /// Every queue ever attached, kept for `drain_all`.
  all: Vec<Arc<RowQueue>>,
  readable: Arc<Notify>,
  strategy: InputStrategy,
  block_size: usize,
  current: usize,
  taken_from_current: usize,
}

impl InputSet {
  pub fn new(queues: Vec<Arc<RowQueue>>, readable: Arc<Notify>, strategy: InputStrategy, block_size: usize) -> Self {
    Self {
      open: queues.clone(),
      all: queues,
      readable,
      strategy,
      block_size: block_size.max(1),
      current: 0,
      taken_from_current: 0,
    }
  }

  /// A copy without input queues is a source (generator) stage.
  pub fn is_source(&self) -> bool {
    self.all.is_empty()
  }

  /// True when some input queue holds a row right now.
  pub fn has_pending(&self) -> bool {
    self.open.iter().any(|q| !q.is_empty())
  }

  fn forget(&mut self, mut closed: Vec<usize>) {
    closed.sort_unstable();
    for idx in closed.into_iter().rev() {
      self.open.remove(idx);
      if idx < self.current {
        self.current -= 1;
      }
    }
    if self.current >= self.open.len() {
      self.current = 0;
      self.taken_from_current = 0;
    }
  }

  fn try_round_robin(&mut self) -> NextRow {
    if self.open.is_empty() {
      return NextRow::Exhausted;
    }
    if self.taken_from_current >= self.block_size {
      self.current = (self.current + 1) % self.open.len();
      self.taken_from_current = 0;
    }

    let count = self.open.len();
    let mut closed = Vec::new();
    let mut found = None;
    for step in 0..count {
      let idx = (self.current + step) % count;
      match self.open[idx].try_get() {
        TryGet::Row(row) => {
          found = Some((idx, row));
          break;
        }
        TryGet::Empty => {}
        TryGet::Closed => closed.push(idx),
      }
    }

    match found {
      Some((idx, row)) => {
        if idx != self.current {
          self.current = idx;
          self.taken_from_current = 0;
        }
        self.taken_from_current += 1;
        self.forget(closed);
        NextRow::Row(row)
      }
      None => {
        self.forget(closed);
        if self.open.is_empty() {
          NextRow::Exhausted
        } else {
          NextRow::Empty
        }
      }
    }
  }

  fn try_sequential(&mut self) -> NextRow {
    while let Some(queue) = self.open.first() {
      match queue.try_get() {
        TryGet::Row(row) => return NextRow::Row(row),
        TryGet::Empty => return NextRow::Empty,
        TryGet::Closed => {
          self.open.remove(0);
        }
      }
    }
    NextRow::Exhausted
  }

  fn try_next(&mut self) -> NextRow {
    match self.strategy {
      InputStrategy::RoundRobin => self.try_round_robin(),
      InputStrategy::Sequential => self.try_sequential(),
    }
  }

  /// A row if one is available right now.
  pub fn try_row(&mut self) -> Option<Row> {
    match self.try_next() {
      NextRow::Row(row) => Some(row),
      NextRow::Empty | NextRow::Exhausted => None,
    }
  }

  /// Next row, parking until one arrives. `None` once every input is exhausted or
  /// the run halted. Cancel-safe.
  pub async fn next(&mut self, signal: &RunSignal) -> Option<Row> {
    loop {
      signal.wait_while_paused().await;

      let readable = self.readable.clone();
      let notified = readable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      match self.try_next() {
        NextRow::Row(row) => return Some(row),
        NextRow::Exhausted => return None,
        NextRow::Empty => {}
      }

      tokio::select! {
        _ = &mut notified => {}
        _ = signal.halted() => {}
      }
    }
  }

  pub fn drain_all(&self) {
    for queue in &self.all {
      queue.drain();
    }
  }
}
