//! Onboarding form: completeness, confirmation, save, then wait for the learner's
//! challenges to be generated.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::PollerConfig;
use crate::domain::{Notice, Route};
use crate::error::ApiError;
use crate::poller::{ChallengeFeed, GenerationPoller, PollHandle, PollOutcome};
use crate::protocol::ProfileUpdate;
use crate::session::SessionStore;
use crate::util::mask_cpf;

pub trait OnboardingApi: ChallengeFeed {
  fn update_profile(&self, body: &ProfileUpdate) -> impl Future<Output = Result<(), ApiError>> + Send;
  fn request_generation(&self, cpf: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl<T: OnboardingApi> OnboardingApi for Arc<T> {
  fn update_profile(&self, body: &ProfileUpdate) -> impl Future<Output = Result<(), ApiError>> + Send {
    (**self).update_profile(body)
  }

  fn request_generation(&self, cpf: &str) -> impl Future<Output = Result<(), ApiError>> + Send {
    (**self).request_generation(cpf)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completeness {
  Empty,
  Partial,
  Complete,
}

impl Completeness {
  /// The question asked before sending an incomplete form.
  pub fn confirmation_prompt(&self) -> Option<&'static str> {
    match self {
      Completeness::Empty => Some(
        "Nenhum campo foi preenchido. Caso não forneça nenhuma informação, os desafios serão genéricos! Deseja continuar assim?",
      ),
      Completeness::Partial => Some(
        "Alguns campos estão em branco. Preenchê-los ajuda a personalizar seus desafios. Deseja continuar sem fornecer os dados?",
      ),
      Completeness::Complete => None,
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OnboardingForm {
  pub role: String,
  pub region: String,
  pub supply_chain: String,
  pub daily_challenges: String,
  pub notes: String,
}

impl OnboardingForm {
  pub const FIELDS: usize = 5;

  fn values(&self) -> [&str; Self::FIELDS] {
    [&self.role, &self.region, &self.supply_chain, &self.daily_challenges, &self.notes]
  }

  pub fn filled(&self) -> usize {
    self.values().iter().filter(|v| !v.trim().is_empty()).count()
  }

  pub fn completeness(&self) -> Completeness {
    match self.filled() {
      0 => Completeness::Empty,
      n if n < Self::FIELDS => Completeness::Partial,
      _ => Completeness::Complete,
    }
  }

  pub fn fill_percent(&self) -> u8 {
    (self.filled() * 100 / Self::FIELDS) as u8
  }

  fn to_update(&self) -> ProfileUpdate {
    ProfileUpdate {
      role: Some(self.role.trim().to_string()),
      region: Some(self.region.trim().to_string()),
      supply_chain: Some(self.supply_chain.trim().to_string()),
      daily_challenges: Some(self.daily_challenges.trim().to_string()),
      notes: Some(self.notes.trim().to_string()),
      onboarding_done: Some(true),
    }
  }
}

/// What the learner agreed to on the form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Consent {
  /// "Concordo com o uso dos dados" checkbox.
  pub data_use: bool,
  /// Answered "continuar assim" to the incomplete-form question.
  pub incomplete_ok: bool,
}

#[derive(Error, Debug)]
pub enum OnboardingError {
  #[error("É preciso concordar com o uso dos dados para enviar o formulário.")]
  ConsentRequired,

  #[error("{}", .0.confirmation_prompt().unwrap_or_default())]
  ConfirmationRequired(Completeness),

  #[error("Erro ao salvar seus dados. Tente novamente.")]
  Save(#[source] ApiError),

  #[error(transparent)]
  Api(#[from] ApiError),
}

impl OnboardingError {
  pub fn notice(&self) -> Notice {
    match self {
      OnboardingError::ConfirmationRequired(_) => Notice::info(self.to_string()),
      _ => Notice::error(self.to_string()),
    }
  }

  pub fn route(&self) -> Option<Route> {
    match self {
      OnboardingError::Save(e) | OnboardingError::Api(e) => e.route(),
      _ => None,
    }
  }
}

pub struct Onboarding<A> {
  api: A,
  session: SessionStore,
  poller: PollerConfig,
}

impl<A: OnboardingApi + Clone + 'static> Onboarding<A> {
  pub fn new(api: A, session: SessionStore, poller: PollerConfig) -> Self {
    Self { api, session, poller }
  }

  /// Save the form, ask for generation and start waiting for the challenges.
  /// The returned handle owns the wait; dropping it stops the polling.
  #[instrument(level = "info", skip(self, form, consent), fields(filled = form.filled()))]
  pub async fn submit(&self, form: &OnboardingForm, consent: Consent) -> Result<PollHandle, OnboardingError> {
    let session = self.session.require().await?;
    if !consent.data_use {
      return Err(OnboardingError::ConsentRequired);
    }
    let completeness = form.completeness();
    if completeness != Completeness::Complete && !consent.incomplete_ok {
      return Err(OnboardingError::ConfirmationRequired(completeness));
    }

    self.api.update_profile(&form.to_update()).await.map_err(|e| {
      warn!(target: "pbl_client", error = %e, "Profile save failed");
      if e.is_unauthorized() { OnboardingError::Api(e) } else { OnboardingError::Save(e) }
    })?;
    info!(target: "pbl_client", ?completeness, "Onboarding form saved");

    // The backend may already be generating; polling still tells us when it is done.
    if let Err(e) = self.api.request_generation(&session.cpf).await {
      warn!(target: "challenge", cpf = %mask_cpf(&session.cpf), error = %e, "Generation request failed; polling anyway");
    }

    Ok(GenerationPoller::new(&self.poller).spawn(self.api.clone()))
  }
}

/// Notice shown right after the form is accepted.
pub fn submitted_notice() -> Notice {
  Notice::success("Formulário enviado! Gerando seus desafios personalizados...")
}

/// Final notice and route once the wait is over.
pub fn finish(outcome: &PollOutcome) -> (Option<Notice>, Option<Route>) {
  (outcome.notice(), outcome.route())
}
