// rowflow/src/core/queue.rs

//! The bounded single-producer/single-consumer row channel between two stage copies.
//!
//! A `RowQueue` is the only cross-unit mutation surface of a run. Occupancy is the
//! backpressure mechanism: `put` parks the producer while the queue is full and `get`
//! parks the consumer while it is empty and open. Both return immediately once the
//! run signal is halted.
//!
//! The mutex guards only the non-blocking critical section; waiting happens on
//! `Notify` handles. All the copies' input queues share one "readable" notify owned
//! by the consumer, and all of a copy's output queues share one "writable" notify
//! owned by the producer, so a copy can wait on many queues with a single waker.

use crate::core::row::Row;
use crate::core::schema::Schema;
use crate::core::signal::RunSignal;
use crate::error::{FlowError, FlowResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Result of a blocking `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
  Accepted,
  /// The queue was closed or drained, or the run halted. The row was dropped.
  Closed,
}

/// Result of a non-blocking `try_get`.
#[derive(Debug)]
pub enum TryGet {
  Row(Row),
  Empty,
  Closed,
}

/// Result of a non-blocking `try_put`.
#[derive(Debug)]
pub enum TryPut {
  Accepted,
  Full(Row),
  Closed,
}

#[derive(Debug, Default)]
struct QueueState {
  rows: VecDeque<Row>,
  closed: bool,
  drained: bool,
  schema: Option<Arc<Schema>>,
}

#[derive(Debug)]
pub struct RowQueue {
  label: String,
  capacity: usize,
  safe_mode: bool,
  state: Mutex<QueueState>,
  readable: Arc<Notify>,
  writable: Arc<Notify>,
  signal: RunSignal,
}

impl RowQueue {
  /// A standalone queue with its own wakers.
  pub fn new(label: impl Into<String>, capacity: usize, signal: RunSignal) -> Self {
    Self::wired(
      label,
      capacity,
      signal,
      Arc::new(Notify::new()),
      Arc::new(Notify::new()),
    )
  }

  /// A queue sharing the consumer's `readable` and the producer's `writable` wakers.
  pub(crate) fn wired(
    label: impl Into<String>,
    capacity: usize,
    signal: RunSignal,
    readable: Arc<Notify>,
    writable: Arc<Notify>,
  ) -> Self {
    Self {
      label: label.into(),
      capacity: capacity.max(1),
      safe_mode: false,
      state: Mutex::new(QueueState::default()),
      readable,
      writable,
      signal,
    }
  }

  /// Rejects rows whose schema differs from the first schema put on the queue.
  pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
    self.safe_mode = safe_mode;
    self
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.state.lock().rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  pub fn is_drained(&self) -> bool {
    self.state.lock().drained
  }

  /// The schema of the first row that entered the queue.
  pub fn schema(&self) -> Option<Arc<Schema>> {
    self.state.lock().schema.clone()
  }

  fn publish_schema(&self, state: &mut QueueState, row: &Row) -> FlowResult<()> {
    match &state.schema {
      None => {
        state.schema = Some(row.schema().clone());
        Ok(())
      }
      Some(published) if self.safe_mode && !row.same_layout(published) => Err(FlowError::SchemaMismatch {
        location: format!("queue {}", self.label),
        message: format!("row layout {} differs from published layout {}", row.schema(), published),
      }),
      Some(_) => Ok(()),
    }
  }

  /// Enqueues `row` if there is room, without waiting.
  pub fn try_put(&self, row: Row) -> FlowResult<TryPut> {
    if self.signal.is_halted() {
      return Ok(TryPut::Closed);
    }
    let mut state = self.state.lock();
    if state.closed || state.drained {
      return Ok(TryPut::Closed);
    }
    if state.rows.len() >= self.capacity {
      return Ok(TryPut::Full(row));
    }
    self.publish_schema(&mut state, &row)?;
    state.rows.push_back(row);
    drop(state);
    self.readable.notify_one();
    Ok(TryPut::Accepted)
  }

  /// Enqueues `row`, parking while the queue is full.
  ///
  /// Returns `Closed` without enqueueing when the run halts while waiting, or when
  /// the consumer drained the queue. A send to a draining sink is not an error.
  ///
  /// Not cancel-safe: dropping the future while it waits drops the row. Use
  /// [`RowQueue::writable`] with [`RowQueue::try_put`] inside `select!`.
  pub async fn put(&self, row: Row) -> FlowResult<PutOutcome> {
    let mut pending = row;
    loop {
      let notified = self.writable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      match self.try_put(pending)? {
        TryPut::Accepted => return Ok(PutOutcome::Accepted),
        TryPut::Closed => return Ok(PutOutcome::Closed),
        TryPut::Full(row) => pending = row,
      }

      tokio::select! {
        _ = &mut notified => {}
        _ = self.signal.halted() => {}
      }
    }
  }

  /// Waits until a `try_put` would be accepted. Returns `false` if it never will be.
  ///
  /// Cancel-safe, and with a single producer the room it observed stays available.
  pub async fn writable(&self) -> bool {
    loop {
      let notified = self.writable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.signal.is_halted() {
        return false;
      }
      {
        let state = self.state.lock();
        if state.closed || state.drained {
          return false;
        }
        if state.rows.len() < self.capacity {
          return true;
        }
      }

      tokio::select! {
        _ = &mut notified => {}
        _ = self.signal.halted() => {}
      }
    }
  }

  /// Dequeues the oldest row without waiting.
  pub fn try_get(&self) -> TryGet {
    if self.signal.is_halted() {
      return TryGet::Closed;
    }
    let mut state = self.state.lock();
    if let Some(row) = state.rows.pop_front() {
      drop(state);
      self.writable.notify_one();
      return TryGet::Row(row);
    }
    if state.closed || state.drained {
      TryGet::Closed
    } else {
      TryGet::Empty
    }
  }

  /// Dequeues the oldest row, parking while the queue is empty and open.
  ///
  /// `None` means no more rows will ever arrive: the queue is closed and empty,
  /// it was drained, or the run halted. Cancel-safe.
  pub async fn get(&self) -> Option<Row> {
    loop {
      let notified = self.readable.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      match self.try_get() {
        TryGet::Row(row) => return Some(row),
        TryGet::Closed => return None,
        TryGet::Empty => {}
      }

      tokio::select! {
        _ = &mut notified => {}
        _ = self.signal.halted() => {}
      }
    }
  }

  /// Producer side: no more rows will be put. Idempotent.
  pub fn close(&self) {
    self.state.lock().closed = true;
    self.readable.notify_one();
  }

  /// Consumer side: gives up on the remaining rows. Later puts are no-ops.
  pub fn drain(&self) {
    {
      let mut state = self.state.lock();
      state.drained = true;
      state.rows.clear();
    }
    self.writable.notify_one();
    self.readable.notify_one();
  }
}
