// rowflow/src/core/signal.rs

//! The run-wide stop/error/pause signal shared by every execution unit of a run.
//!
//! The flags are plain atomics; the `Notify` only wakes units that are parked in
//! a queue operation or in the pause wait so they re-check the flags.

use crate::core::control::RunState;
use crate::error::ErrorDetail;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalInner {
  /// Hard stop: set by `stop()` and by any run-level failure.
  halted: AtomicBool,
  safe_stop: AtomicBool,
  errored: AtomicBool,
  paused: AtomicBool,
  started: AtomicBool,
  finished: AtomicBool,
  changed: Notify,
  first_error: Mutex<Option<ErrorDetail>>,
}

/// Cloneable handle to the shared signal of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSignal {
  inner: Arc<SignalInner>,
}

impl RunSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Requests every unit to stop at its next blocking point.
  pub fn stop(&self) {
    self.inner.halted.store(true, Ordering::SeqCst);
    self.inner.paused.store(false, Ordering::SeqCst);
    self.inner.changed.notify_waiters();
  }

  /// Asks source stages to stop producing while the rest of the graph drains.
  pub fn safe_stop(&self) {
    self.inner.safe_stop.store(true, Ordering::SeqCst);
    self.inner.paused.store(false, Ordering::SeqCst);
    self.inner.changed.notify_waiters();
  }

  /// Records a run-level failure and halts the run.
  ///
  /// Returns `true` when `detail` became the run's first error.
  pub fn fail(&self, detail: ErrorDetail) -> bool {
    let first = {
      let mut slot = self.inner.first_error.lock();
      if slot.is_none() {
        *slot = Some(detail);
        true
      } else {
        false
      }
    };
    self.inner.errored.store(true, Ordering::SeqCst);
    self.stop();
    first
  }

  pub fn pause(&self) {
    if !self.is_halted() {
      self.inner.paused.store(true, Ordering::SeqCst);
      self.inner.changed.notify_waiters();
    }
  }

  pub fn resume(&self) {
    self.inner.paused.store(false, Ordering::SeqCst);
    self.inner.changed.notify_waiters();
  }

  pub fn is_halted(&self) -> bool {
    self.inner.halted.load(Ordering::SeqCst)
  }

  pub fn is_safe_stopping(&self) -> bool {
    self.inner.safe_stop.load(Ordering::SeqCst)
  }

  /// True after `stop`, `safe_stop` or a failure.
  pub fn is_stop_requested(&self) -> bool {
    self.is_halted() || self.is_safe_stopping()
  }

  pub fn is_errored(&self) -> bool {
    self.inner.errored.load(Ordering::SeqCst)
  }

  pub fn is_paused(&self) -> bool {
    self.inner.paused.load(Ordering::SeqCst)
  }

  pub fn first_error(&self) -> Option<ErrorDetail> {
    self.inner.first_error.lock().clone()
  }

  /// Resolves once the run is halted.
  pub async fn halted(&self) {
    loop {
      let notified = self.inner.changed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_halted() {
        return;
      }
      notified.await;
    }
  }

  /// Parks the caller while the run is paused. Returns immediately otherwise.
  pub async fn wait_while_paused(&self) {
    loop {
      let notified = self.inner.changed.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if !self.is_paused() || self.is_halted() {
        return;
      }
      notified.await;
    }
  }

  pub(crate) fn mark_started(&self) {
    self.inner.started.store(true, Ordering::SeqCst);
  }

  pub(crate) fn mark_finished(&self) {
    self.inner.finished.store(true, Ordering::SeqCst);
    self.inner.changed.notify_waiters();
  }

  pub fn state(&self) -> RunState {
    if self.inner.finished.load(Ordering::SeqCst) {
      if self.is_errored() {
        RunState::FinishedWithErrors
      } else if self.is_stop_requested() {
        RunState::Stopped
      } else {
        RunState::Finished
      }
    } else if !self.inner.started.load(Ordering::SeqCst) {
      RunState::Initializing
    } else if self.is_halted() {
      RunState::Halting
    } else if self.is_paused() {
      RunState::Paused
    } else {
      RunState::Running
    }
  }
}

/// Read-only view of the run signal handed to stages that wait on channels of
/// their own and need to notice a stop while parked there.
#[derive(Debug, Clone)]
pub struct StopSignal(RunSignal);

impl StopSignal {
  pub(crate) fn new(signal: RunSignal) -> Self {
    Self(signal)
  }

  pub fn is_stopped(&self) -> bool {
    self.0.is_halted()
  }

  /// Resolves once the owning run is halted.
  pub async fn stopped(&self) {
    self.0.halted().await
  }
}
