//! Generation poller: waits for the backend's asynchronous challenge generation.
//!
//! States: `Idle → Polling → {Succeeded | TimedOut | Cancelled}`.
//! - each tick first checks the ceiling, then polls the challenge list once
//! - polls are single-flight: ticks that fire while a poll is outstanding are skipped
//! - poll errors are swallowed; only the ceiling or a non-empty list ends the loop
//! - both terminal outcomes send the learner to the challenges view

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::PollerConfig;
use crate::domain::{Challenge, Notice, Route};
use crate::error::ApiError;
use crate::task::{CancelSignal, ScheduledTask};

/// Source of the learner's challenge list.
pub trait ChallengeFeed: Send + Sync {
  fn list_challenges(&self) -> impl Future<Output = Result<Vec<Challenge>, ApiError>> + Send;
}

impl<T: ChallengeFeed> ChallengeFeed for Arc<T> {
  fn list_challenges(&self) -> impl Future<Output = Result<Vec<Challenge>, ApiError>> + Send {
    (**self).list_challenges()
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
  Idle,
  Polling,
  Succeeded,
  TimedOut,
  Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
  Succeeded { challenges: usize, elapsed: Duration },
  TimedOut { elapsed: Duration },
  Cancelled,
}

impl PollOutcome {
  pub fn notice(&self) -> Option<Notice> {
    match self {
      PollOutcome::Succeeded { .. } => Some(Notice::success("Seus desafios foram gerados!")),
      PollOutcome::TimedOut { .. } => Some(Notice::error(
        "A geração dos desafios está demorando. Você pode ir para a página de desafios e atualizar em breve.",
      )),
      PollOutcome::Cancelled => None,
    }
  }

  /// Success and timeout both move forward; a cancelled poll leaves navigation alone.
  pub fn route(&self) -> Option<Route> {
    match self {
      PollOutcome::Succeeded { .. } | PollOutcome::TimedOut { .. } => Some(Route::Challenges),
      PollOutcome::Cancelled => None,
    }
  }
}

#[derive(Debug)]
pub struct GenerationPoller {
  interval: Duration,
  ceiling: Duration,
  state: PollState,
  polls: u32,
  outcome: Option<PollOutcome>,
}

impl GenerationPoller {
  pub fn new(cfg: &PollerConfig) -> Self {
    Self::with_timing(cfg.interval(), cfg.ceiling())
  }

  pub fn with_timing(interval: Duration, ceiling: Duration) -> Self {
    Self { interval, ceiling, state: PollState::Idle, polls: 0, outcome: None }
  }

  pub fn state(&self) -> PollState {
    self.state
  }

  /// Requests issued so far.
  pub fn polls_issued(&self) -> u32 {
    self.polls
  }

  /// Drive the poller to a terminal state. A poller runs once; later calls return
  /// the first outcome.
  #[instrument(level = "info", skip(self, feed, cancel), fields(interval_ms = self.interval.as_millis() as u64, ceiling_ms = self.ceiling.as_millis() as u64))]
  pub async fn run<F>(&mut self, feed: &F, mut cancel: CancelSignal) -> PollOutcome
  where
    F: ChallengeFeed + ?Sized,
  {
    if let Some(done) = &self.outcome {
      warn!(target: "challenge", state = ?self.state, "Poller already ran; returning previous outcome");
      return done.clone();
    }

    let started = Instant::now();
    self.state = PollState::Polling;
    let mut ticker = interval_at(started + self.interval, self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break PollOutcome::Cancelled,
        _ = ticker.tick() => {}
      }

      let elapsed = started.elapsed();
      if elapsed >= self.ceiling {
        break PollOutcome::TimedOut { elapsed };
      }

      self.polls += 1;
      let polled = tokio::select! {
        biased;
        _ = cancel.cancelled() => break PollOutcome::Cancelled,
        res = feed.list_challenges() => res,
      };
      match polled {
        Ok(list) if !list.is_empty() => {
          break PollOutcome::Succeeded { challenges: list.len(), elapsed: started.elapsed() };
        }
        Ok(_) => debug!(target: "challenge", poll = self.polls, elapsed_ms = elapsed.as_millis() as u64, "No challenges yet"),
        Err(e) => debug!(target: "challenge", poll = self.polls, error = %e, "Poll failed; retrying next tick"),
      }
    };

    self.state = match &outcome {
      PollOutcome::Succeeded { .. } => PollState::Succeeded,
      PollOutcome::TimedOut { .. } => PollState::TimedOut,
      PollOutcome::Cancelled => PollState::Cancelled,
    };
    info!(target: "challenge", state = ?self.state, polls = self.polls, "Generation polling finished");
    self.outcome = Some(outcome.clone());
    outcome
  }

  /// Run on a background task owned by the returned handle.
  pub fn spawn<F>(mut self, feed: F) -> PollHandle
  where
    F: ChallengeFeed + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let task = ScheduledTask::spawn("generation-poller", move |cancel| async move {
      let outcome = self.run(&feed, cancel).await;
      let _ = tx.send(outcome);
    });
    PollHandle { task, outcome: rx }
  }
}

/// Owner of a spawned poller. Dropping it stops the polling.
pub struct PollHandle {
  task: ScheduledTask,
  outcome: oneshot::Receiver<PollOutcome>,
}

impl PollHandle {
  pub async fn outcome(self) -> PollOutcome {
    let PollHandle { task, outcome } = self;
    let result = outcome.await.unwrap_or(PollOutcome::Cancelled);
    drop(task);
    result
  }

  /// Tear down (view unmount) and wait for the loop to stop.
  pub async fn cancel(self) -> PollOutcome {
    let PollHandle { task, mut outcome } = self;
    task.cancel().await;
    outcome.try_recv().unwrap_or(PollOutcome::Cancelled)
  }
}
