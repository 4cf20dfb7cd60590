//! In-memory stand-in for the platform API, shared by controller tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{watch, Notify};

use crate::account::AccountApi;
use crate::board::BoardApi;
use crate::domain::{AttemptRecord, Challenge, ChallengeKind, ContentUnit, Evaluation, Profile, Release};
use crate::error::ApiError;
use crate::onboarding::OnboardingApi;
use crate::poller::ChallengeFeed;
use crate::protocol::{AttemptIn, FinalizeIn, ProfileUpdate, TokenOut};
use crate::submission::AttemptApi;

pub fn record(id: &str, attempt: u32, finalized: bool) -> AttemptRecord {
  AttemptRecord {
    challenge_id: id.into(),
    attempt,
    finalized,
    score: Some(5.0),
    feedback: Some("ok".into()),
    ideal_answer: None,
  }
}

pub fn challenge(id: &str, kind: ChallengeKind, content_id: &str) -> Challenge {
  Challenge {
    id: id.into(),
    text: format!("Texto do desafio {id}"),
    kind,
    content_id: content_id.into(),
    module: String::new(),
    lesson: String::new(),
    released: false,
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FakeApi {
  history: Mutex<Vec<AttemptRecord>>,
  submissions: Mutex<Vec<AttemptIn>>,
  finalizations: Mutex<Vec<FinalizeIn>>,
  profile_updates: Mutex<Vec<ProfileUpdate>>,
  generation_requests: Mutex<Vec<String>>,
  challenges: Mutex<Vec<Challenge>>,
  releases: Mutex<Vec<Release>>,
  contents: Mutex<Vec<ContentUnit>>,
  profiles: Mutex<Vec<Profile>>,
  logins: Mutex<Vec<String>>,
  fail_login: AtomicBool,
  fail_submit: AtomicBool,
  fail_history: AtomicBool,
  fail_profile: AtomicBool,
  fail_generation: AtomicBool,
  lag_history: AtomicBool,
  history_calls: AtomicUsize,
  challenge_calls: AtomicUsize,
  gate: watch::Sender<bool>,
  submitting: Notify,
}

impl Default for FakeApi {
  fn default() -> Self {
    let (gate, _) = watch::channel(true);
    Self {
      history: Mutex::default(),
      submissions: Mutex::default(),
      finalizations: Mutex::default(),
      profile_updates: Mutex::default(),
      generation_requests: Mutex::default(),
      challenges: Mutex::default(),
      releases: Mutex::default(),
      contents: Mutex::default(),
      profiles: Mutex::default(),
      logins: Mutex::default(),
      fail_login: AtomicBool::new(false),
      fail_submit: AtomicBool::new(false),
      fail_history: AtomicBool::new(false),
      fail_profile: AtomicBool::new(false),
      fail_generation: AtomicBool::new(false),
      lag_history: AtomicBool::new(false),
      history_calls: AtomicUsize::new(0),
      challenge_calls: AtomicUsize::new(0),
      gate,
      submitting: Notify::new(),
    }
  }
}

impl FakeApi {
  pub fn with_history(history: Vec<AttemptRecord>) -> Self {
    let api = Self::default();
    *lock(&api.history) = history;
    api
  }

  pub fn set_challenges(&self, list: Vec<Challenge>) {
    *lock(&self.challenges) = list;
  }

  pub fn set_releases(&self, content_ids: &[&str]) {
    *lock(&self.releases) = content_ids.iter().map(|c| Release { content_id: c.to_string() }).collect();
  }

  pub fn set_contents(&self, units: Vec<ContentUnit>) {
    *lock(&self.contents) = units;
  }

  pub fn set_profiles(&self, rows: Vec<Profile>) {
    *lock(&self.profiles) = rows;
  }

  pub fn fail_login(&self, fail: bool) {
    self.fail_login.store(fail, Ordering::SeqCst);
  }

  pub fn fail_submissions(&self, fail: bool) {
    self.fail_submit.store(fail, Ordering::SeqCst);
  }

  pub fn fail_history(&self, fail: bool) {
    self.fail_history.store(fail, Ordering::SeqCst);
  }

  pub fn fail_profile(&self, fail: bool) {
    self.fail_profile.store(fail, Ordering::SeqCst);
  }

  pub fn fail_generation(&self, fail: bool) {
    self.fail_generation.store(fail, Ordering::SeqCst);
  }

  /// Accept submissions without adding them to the history the API reports.
  pub fn lag_history(&self, lag: bool) {
    self.lag_history.store(lag, Ordering::SeqCst);
  }

  /// Park every submission until `release_submissions`.
  pub fn hold_submissions(&self) {
    self.gate.send_replace(false);
  }

  pub fn release_submissions(&self) {
    self.gate.send_replace(true);
  }

  pub async fn wait_until_submitting(&self) {
    self.submitting.notified().await;
  }

  pub fn submissions(&self) -> Vec<AttemptIn> {
    lock(&self.submissions).clone()
  }

  pub fn finalizations(&self) -> Vec<FinalizeIn> {
    lock(&self.finalizations).clone()
  }

  pub fn profile_updates(&self) -> Vec<ProfileUpdate> {
    lock(&self.profile_updates).clone()
  }

  pub fn generation_requests(&self) -> Vec<String> {
    lock(&self.generation_requests).clone()
  }

  pub fn logins(&self) -> Vec<String> {
    lock(&self.logins).clone()
  }

  pub fn history_calls(&self) -> usize {
    self.history_calls.load(Ordering::SeqCst)
  }

  pub fn challenge_calls(&self) -> usize {
    self.challenge_calls.load(Ordering::SeqCst)
  }
}

fn internal(msg: &str) -> ApiError {
  ApiError::Http { status: 500, message: msg.into() }
}

impl AttemptApi for FakeApi {
  async fn submit_attempt(&self, body: &AttemptIn) -> Result<Evaluation, ApiError> {
    self.submitting.notify_one();
    let mut gate = self.gate.subscribe();
    let _ = gate.wait_for(|open| *open).await;

    lock(&self.submissions).push(body.clone());
    if self.fail_submit.load(Ordering::SeqCst) {
      return Err(internal("Erro interno na avaliação"));
    }
    if self.lag_history.load(Ordering::SeqCst) {
      return Ok(Evaluation { score: 7.5, feedback: "Bom trabalho".into(), ideal_answer: None });
    }
    lock(&self.history).push(AttemptRecord {
      challenge_id: body.challenge_id.clone(),
      attempt: body.attempt,
      finalized: body.attempt >= 3,
      score: Some(7.5),
      feedback: Some("Bom trabalho".into()),
      ideal_answer: None,
    });
    Ok(Evaluation { score: 7.5, feedback: "Bom trabalho".into(), ideal_answer: None })
  }

  async fn finalize_attempt(&self, body: &FinalizeIn) -> Result<(), ApiError> {
    lock(&self.finalizations).push(body.clone());
    for rec in lock(&self.history).iter_mut() {
      if rec.challenge_id == body.challenge_id && rec.attempt == body.attempt {
        rec.finalized = true;
      }
    }
    Ok(())
  }

  async fn attempt_history(&self) -> Result<Vec<AttemptRecord>, ApiError> {
    self.history_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_history.load(Ordering::SeqCst) {
      return Err(internal("histórico indisponível"));
    }
    Ok(lock(&self.history).clone())
  }
}

impl ChallengeFeed for FakeApi {
  async fn list_challenges(&self) -> Result<Vec<Challenge>, ApiError> {
    self.challenge_calls.fetch_add(1, Ordering::SeqCst);
    Ok(lock(&self.challenges).clone())
  }
}

impl OnboardingApi for FakeApi {
  async fn update_profile(&self, body: &ProfileUpdate) -> Result<(), ApiError> {
    if self.fail_profile.load(Ordering::SeqCst) {
      return Err(internal("falha ao salvar"));
    }
    lock(&self.profile_updates).push(body.clone());
    Ok(())
  }

  async fn request_generation(&self, cpf: &str) -> Result<(), ApiError> {
    if self.fail_generation.load(Ordering::SeqCst) {
      return Err(internal("fila indisponível"));
    }
    lock(&self.generation_requests).push(cpf.to_string());
    Ok(())
  }
}

impl BoardApi for FakeApi {
  async fn releases(&self, _cohort: &str) -> Result<Vec<Release>, ApiError> {
    Ok(lock(&self.releases).clone())
  }

  async fn content_units(&self) -> Result<Vec<ContentUnit>, ApiError> {
    Ok(lock(&self.contents).clone())
  }
}

impl AccountApi for FakeApi {
  async fn login(&self, cpf: &str) -> Result<TokenOut, ApiError> {
    lock(&self.logins).push(cpf.to_string());
    if self.fail_login.load(Ordering::SeqCst) {
      return Err(ApiError::Http { status: 401, message: "CPF não encontrado".into() });
    }
    Ok(TokenOut { access_token: format!("token-{cpf}"), token_type: Some("bearer".into()) })
  }

  async fn profiles(&self) -> Result<Vec<Profile>, ApiError> {
    Ok(lock(&self.profiles).clone())
  }
}
