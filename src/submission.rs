//! Answer submission: local preconditions, one scored attempt, then reconciliation
//! with the server's history.
//!
//! Flow per submission:
//! 1) reject if an attempt for the same challenge is already in flight
//! 2) reject locally (no request) when finalized, at the attempt cap, or too short
//! 3) POST the attempt with `attempt = count + 1`
//! 4) on success: clear the draft, fold the evaluation into the tracker, then
//!    refetch the whole history and replace the tracker with it (the accepted
//!    attempt stays folded in, so the count never goes back)
//! 5) on failure: draft and tracker untouched

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::domain::{AttemptRecord, Evaluation, Notice};
use crate::error::ApiError;
use crate::protocol::{AttemptIn, FinalizeIn};
use crate::tracker::{AttemptStatus, AttemptTracker, MAX_ATTEMPTS};

/// Minimum answer length, counted in characters after trimming.
pub const MIN_ANSWER_CHARS: usize = 20;

/// The attempt endpoints the pipeline needs.
pub trait AttemptApi: Send + Sync {
  fn submit_attempt(&self, body: &AttemptIn) -> impl Future<Output = Result<Evaluation, ApiError>> + Send;
  fn finalize_attempt(&self, body: &FinalizeIn) -> impl Future<Output = Result<(), ApiError>> + Send;
  fn attempt_history(&self) -> impl Future<Output = Result<Vec<AttemptRecord>, ApiError>> + Send;
}

impl<T: AttemptApi> AttemptApi for Arc<T> {
  fn submit_attempt(&self, body: &AttemptIn) -> impl Future<Output = Result<Evaluation, ApiError>> + Send {
    (**self).submit_attempt(body)
  }

  fn finalize_attempt(&self, body: &FinalizeIn) -> impl Future<Output = Result<(), ApiError>> + Send {
    (**self).finalize_attempt(body)
  }

  fn attempt_history(&self) -> impl Future<Output = Result<Vec<AttemptRecord>, ApiError>> + Send {
    (**self).attempt_history()
  }
}

#[derive(Error, Debug)]
pub enum SubmissionError {
  #[error("A resposta deve ter ao menos {min} caracteres.")]
  TooShort { min: usize, len: usize },

  #[error("Limite de {max} tentativas atingido.")]
  LimitReached { max: u32 },

  #[error("Resposta já foi finalizada.")]
  AlreadyFinalized,

  #[error("Faça ao menos uma tentativa antes.")]
  NoAttemptYet,

  #[error("Aguarde a avaliação da resposta anterior.")]
  InFlight,

  #[error("Erro ao enviar: {0}")]
  Request(#[from] ApiError),
}

impl SubmissionError {
  /// Validation failures never reached the network.
  pub fn is_local(&self) -> bool {
    !matches!(self, SubmissionError::Request(_))
  }

  pub fn notice(&self) -> Notice {
    Notice::error(self.to_string())
  }
}

/// The answer text box. Only a successful submission empties it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnswerDraft {
  text: String,
}

impl AnswerDraft {
  pub fn new(text: impl Into<String>) -> Self {
    Self { text: text.into() }
  }

  pub fn text(&self) -> &str {
    &self.text
  }

  pub fn set(&mut self, text: impl Into<String>) {
    self.text = text.into();
  }

  pub fn clear(&mut self) {
    self.text.clear();
  }

  pub fn is_empty(&self) -> bool {
    self.text.is_empty()
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionOutcome {
  pub attempt: u32,
  pub evaluation: Evaluation,
  pub status: AttemptStatus,
  /// False when the follow-up history fetch failed; the tracker then holds the
  /// optimistic merge until the next successful refresh.
  pub history_refreshed: bool,
}

impl SubmissionOutcome {
  pub fn notice(&self) -> Notice {
    Notice::success("Resposta enviada com sucesso!")
  }
}

pub struct SubmissionPipeline<A> {
  api: A,
  cpf: String,
  tracker: RwLock<AttemptTracker>,
  in_flight: Mutex<HashSet<String>>,
}

impl<A: AttemptApi> SubmissionPipeline<A> {
  pub fn new(api: A, cpf: impl Into<String>) -> Self {
    Self {
      api,
      cpf: cpf.into(),
      tracker: RwLock::new(AttemptTracker::default()),
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  pub fn api(&self) -> &A {
    &self.api
  }

  /// Replace the tracker with the server's history.
  #[instrument(level = "debug", skip(self))]
  pub async fn refresh(&self) -> Result<(), ApiError> {
    let history = self.api.attempt_history().await?;
    *self.tracker.write().await = AttemptTracker::from_history(history);
    Ok(())
  }

  pub async fn status(&self, challenge_id: &str) -> AttemptStatus {
    self.tracker.read().await.status(challenge_id)
  }

  /// Snapshot of the current tracker.
  pub async fn tracker(&self) -> AttemptTracker {
    self.tracker.read().await.clone()
  }

  pub fn is_in_flight(&self, challenge_id: &str) -> bool {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).contains(challenge_id)
  }

  /// Local preconditions. Returns the attempt number a submission would carry.
  pub async fn check(&self, challenge_id: &str, answer: &str) -> Result<u32, SubmissionError> {
    let status = self.status(challenge_id).await;
    if status.finalized && status.count < MAX_ATTEMPTS {
      return Err(SubmissionError::AlreadyFinalized);
    }
    if status.count >= MAX_ATTEMPTS {
      return Err(SubmissionError::LimitReached { max: MAX_ATTEMPTS });
    }
    let len = answer.trim().chars().count();
    if len < MIN_ANSWER_CHARS {
      return Err(SubmissionError::TooShort { min: MIN_ANSWER_CHARS, len });
    }
    Ok(status.count + 1)
  }

  #[instrument(level = "info", skip(self, draft), fields(%challenge_id, answer_len = draft.text().len()))]
  pub async fn submit(&self, challenge_id: &str, draft: &mut AnswerDraft) -> Result<SubmissionOutcome, SubmissionError> {
    let _guard = self.begin(challenge_id)?;
    let attempt = self.check(challenge_id, draft.text()).await?;

    let body = AttemptIn {
      cpf: self.cpf.clone(),
      challenge_id: challenge_id.to_string(),
      answer: draft.text().to_string(),
      attempt,
    };
    let evaluation = match self.api.submit_attempt(&body).await {
      Ok(ev) => ev,
      Err(e) => {
        warn!(target: "challenge", %challenge_id, attempt, error = %e, "Attempt submission failed");
        return Err(e.into());
      }
    };
    draft.clear();

    let acked = AttemptRecord {
      challenge_id: challenge_id.to_string(),
      attempt,
      finalized: attempt >= MAX_ATTEMPTS,
      score: Some(evaluation.score),
      feedback: Some(evaluation.feedback.clone()),
      ideal_answer: evaluation.ideal_answer.clone(),
    };
    let merged = self.tracker.read().await.with_record(acked.clone());
    *self.tracker.write().await = merged;

    let history_refreshed = match self.api.attempt_history().await {
      Ok(history) => {
        // A history that has not caught up yet must not roll the count back.
        let refreshed = AttemptTracker::from_history(history).with_record(acked);
        *self.tracker.write().await = refreshed;
        true
      }
      Err(e) => {
        warn!(target: "challenge", %challenge_id, error = %e, "History refresh after submission failed; keeping local merge");
        false
      }
    };

    let status = self.status(challenge_id).await;
    info!(target: "challenge", %challenge_id, attempt, score = %format!("{:.1}", evaluation.score), count = status.count, finalized = status.finalized, "Attempt evaluated");
    Ok(SubmissionOutcome { attempt, evaluation, status, history_refreshed })
  }

  /// Mark the latest attempt as the learner's final answer.
  #[instrument(level = "info", skip(self), fields(%challenge_id))]
  pub async fn finalize(&self, challenge_id: &str) -> Result<AttemptStatus, SubmissionError> {
    let _guard = self.begin(challenge_id)?;
    let status = self.status(challenge_id).await;
    if status.count == 0 {
      return Err(SubmissionError::NoAttemptYet);
    }
    if status.finalized {
      return Err(SubmissionError::AlreadyFinalized);
    }

    let body = FinalizeIn { cpf: self.cpf.clone(), challenge_id: challenge_id.to_string(), attempt: status.count };
    if let Err(e) = self.api.finalize_attempt(&body).await {
      warn!(target: "challenge", %challenge_id, error = %e, "Finalize failed");
      return Err(e.into());
    }

    let closed = self.tracker.read().await.with_finalized(challenge_id);
    *self.tracker.write().await = closed;
    match self.api.attempt_history().await {
      Ok(history) => {
        // The server may lag behind the finalize call; keep the flag either way.
        let refreshed = AttemptTracker::from_history(history).with_finalized(challenge_id);
        *self.tracker.write().await = refreshed;
      }
      Err(e) => warn!(target: "challenge", %challenge_id, error = %e, "History refresh after finalize failed"),
    }

    info!(target: "challenge", %challenge_id, attempt = status.count, "Attempt marked final");
    Ok(self.status(challenge_id).await)
  }

  fn begin(&self, challenge_id: &str) -> Result<InFlightGuard<'_>, SubmissionError> {
    let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if !set.insert(challenge_id.to_string()) {
      return Err(SubmissionError::InFlight);
    }
    Ok(InFlightGuard { set: &self.in_flight, id: challenge_id.to_string() })
  }
}

/// Releases the per-challenge in-flight slot on every exit path.
struct InFlightGuard<'a> {
  set: &'a Mutex<HashSet<String>>,
  id: String,
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{record, FakeApi};

  const VALID: &str = "Uma resposta com 25 chars";

  fn pipeline(api: Arc<FakeApi>) -> SubmissionPipeline<Arc<FakeApi>> {
    SubmissionPipeline::new(api, "12345678909")
  }

  #[tokio::test]
  async fn second_attempt_is_posted_and_history_reconciled() {
    let api = Arc::new(FakeApi::with_history(vec![record("d1", 1, false)]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();
    assert_eq!(VALID.chars().count(), 25);

    let mut draft = AnswerDraft::new(VALID);
    let out = p.submit("d1", &mut draft).await.expect("submitted");

    assert_eq!(out.attempt, 2);
    assert!(out.history_refreshed);
    assert_eq!(out.status.count, 2);
    assert!(!out.status.finalized);
    assert!(draft.is_empty());
    let sent = api.submissions();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attempt, 2);
    assert_eq!(sent[0].cpf, "12345678909");
    assert_eq!(api.history_calls(), 2);
  }

  #[tokio::test]
  async fn lagging_history_does_not_roll_the_count_back() {
    let api = Arc::new(FakeApi::with_history(vec![record("d1", 1, false)]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();
    api.lag_history(true);

    let mut draft = AnswerDraft::new(VALID);
    let out = p.submit("d1", &mut draft).await.unwrap();
    assert!(out.history_refreshed);
    assert_eq!(out.attempt, 2);
    assert_eq!(out.status.count, 2);
    assert_eq!(out.status.score, Some(7.5));

    let mut next = AnswerDraft::new(VALID);
    p.submit("d1", &mut next).await.unwrap();
    let attempts: Vec<u32> = api.submissions().iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![2, 3]);
  }

  #[tokio::test]
  async fn short_answer_never_reaches_the_network() {
    let api = Arc::new(FakeApi::default());
    let p = pipeline(api.clone());
    let mut draft = AnswerDraft::new("   curta demais   ");
    let err = p.submit("d1", &mut draft).await.unwrap_err();
    assert!(matches!(err, SubmissionError::TooShort { min: 20, .. }));
    assert!(err.is_local());
    assert!(api.submissions().is_empty());
    assert_eq!(draft.text(), "   curta demais   ");
  }

  #[tokio::test]
  async fn padding_does_not_count_towards_length() {
    let p = pipeline(Arc::new(FakeApi::default()));
    let padded = format!("{:^40}", "dezenove caracteres");
    assert!(matches!(p.check("d1", &padded).await, Err(SubmissionError::TooShort { len: 19, .. })));
    assert_eq!(p.check("d1", "vinte caracteres, ok").await.unwrap(), 1);
  }

  #[tokio::test]
  async fn closed_challenges_are_rejected_locally() {
    let api = Arc::new(FakeApi::with_history(vec![
      record("done", 3, true),
      record("capped", 3, false),
      record("early", 1, true),
    ]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();

    for id in ["done", "capped"] {
      let mut draft = AnswerDraft::new(VALID);
      let err = p.submit(id, &mut draft).await.unwrap_err();
      assert!(matches!(err, SubmissionError::LimitReached { max: 3 }), "{id}: {err:?}");
    }
    let mut draft = AnswerDraft::new(VALID);
    assert!(matches!(p.submit("early", &mut draft).await, Err(SubmissionError::AlreadyFinalized)));
    assert!(api.submissions().is_empty());
  }

  #[tokio::test]
  async fn failed_submission_leaves_everything_untouched() {
    let api = Arc::new(FakeApi::with_history(vec![record("d1", 1, false)]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();
    api.fail_submissions(true);

    let mut draft = AnswerDraft::new(VALID);
    let err = p.submit("d1", &mut draft).await.unwrap_err();
    assert!(!err.is_local());
    assert_eq!(err.to_string(), "Erro ao enviar: Erro interno na avaliação");
    assert_eq!(draft.text(), VALID);
    let status = p.status("d1").await;
    assert_eq!(status.count, 1);
    assert!(!status.finalized);
    assert!(!p.is_in_flight("d1"));
  }

  #[tokio::test]
  async fn third_attempt_locks_even_when_refresh_fails() {
    let api = Arc::new(FakeApi::with_history(vec![record("d1", 2, false)]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();
    api.fail_history(true);

    let mut draft = AnswerDraft::new(VALID);
    let out = p.submit("d1", &mut draft).await.unwrap();
    assert!(!out.history_refreshed);
    assert_eq!(out.status.count, 3);
    assert!(out.status.finalized);
    assert_eq!(out.status.score, Some(7.5));

    let mut again = AnswerDraft::new(VALID);
    assert!(matches!(p.submit("d1", &mut again).await, Err(SubmissionError::LimitReached { .. })));
    assert_eq!(api.submissions().len(), 1);
  }

  #[tokio::test]
  async fn concurrent_submission_for_same_challenge_is_rejected() {
    let api = Arc::new(FakeApi::default());
    api.hold_submissions();
    let p = Arc::new(pipeline(api.clone()));

    let first = {
      let p = p.clone();
      tokio::spawn(async move {
        let mut draft = AnswerDraft::new(VALID);
        p.submit("d1", &mut draft).await
      })
    };
    api.wait_until_submitting().await;
    assert!(p.is_in_flight("d1"));

    let mut draft = AnswerDraft::new(VALID);
    assert!(matches!(p.submit("d1", &mut draft).await, Err(SubmissionError::InFlight)));
    // Other challenges are not blocked by the outstanding one.
    assert_eq!(p.check("d2", VALID).await.unwrap(), 1);

    api.release_submissions();
    let out = first.await.unwrap().unwrap();
    assert_eq!(out.attempt, 1);
    assert_eq!(api.submissions().len(), 1);
    assert!(!p.is_in_flight("d1"));
  }

  #[tokio::test]
  async fn finalize_requires_an_attempt_and_closes_the_challenge() {
    let api = Arc::new(FakeApi::with_history(vec![record("d1", 1, false)]));
    let p = pipeline(api.clone());
    p.refresh().await.unwrap();

    assert!(matches!(p.finalize("d2").await, Err(SubmissionError::NoAttemptYet)));

    let status = p.finalize("d1").await.unwrap();
    assert!(status.finalized);
    assert_eq!(status.count, 1);
    let sent = api.finalizations();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attempt, 1);

    assert!(matches!(p.finalize("d1").await, Err(SubmissionError::AlreadyFinalized)));
    let mut draft = AnswerDraft::new(VALID);
    assert!(matches!(p.submit("d1", &mut draft).await, Err(SubmissionError::AlreadyFinalized)));
  }
}
