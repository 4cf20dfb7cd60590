//! Cancellable background work: one-shot tasks and fixed-period recurring tasks.
//!
//! Dropping a `ScheduledTask` cancels it. `cancel()` does the same but waits for the
//! task to observe the signal and finish, so its timers are gone when it returns.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Receiving side of a cancellation request.
#[derive(Clone, Debug)]
pub struct CancelSignal {
  rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
  /// A signal that never fires, for running cancellable code inline.
  pub fn never() -> Self {
    Self { rx: None }
  }

  pub fn is_cancelled(&self) -> bool {
    self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
  }

  /// Resolves once cancellation is requested (or the owner is gone).
  pub async fn cancelled(&mut self) {
    match &mut self.rx {
      Some(rx) => {
        let _ = rx.wait_for(|c| *c).await;
      }
      None => std::future::pending::<()>().await,
    }
  }
}

pub struct ScheduledTask {
  name: &'static str,
  cancel: watch::Sender<bool>,
  handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
  /// Spawn `f` with a signal it must watch to stop early.
  pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
  where
    F: FnOnce(CancelSignal) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (cancel, rx) = watch::channel(false);
    let handle = tokio::spawn(f(CancelSignal { rx: Some(rx) }));
    debug!(target: "pbl_client", task = name, "Task spawned");
    Self { name, cancel, handle: Some(handle) }
  }

  /// Run `f` every `period`, first after one period. A run that overlaps the next
  /// tick makes that tick skip; runs never overlap.
  pub fn every<F, Fut>(name: &'static str, period: Duration, mut f: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Self::spawn(name, move |mut cancel| async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {}
        }
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = f() => {}
        }
      }
    })
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
  }

  /// Request cancellation and wait until the task has stopped.
  pub async fn cancel(mut self) {
    self.cancel.send_replace(true);
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
    debug!(target: "pbl_client", task = self.name, "Task cancelled");
  }
}

impl Drop for ScheduledTask {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.cancel.send_replace(true);
      handle.abort();
    }
  }
}
