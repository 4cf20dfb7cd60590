//! Login by CPF, course listing/selection, profile and logout.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::domain::{Course, Notice, Profile, Route};
use crate::error::ApiError;
use crate::protocol::TokenOut;
use crate::session::{Session, SessionStore};
use crate::util::{mask_cpf, normalize_cpf};

pub const CPF_DIGITS: usize = 11;

pub trait AccountApi: Send + Sync {
  fn login(&self, cpf: &str) -> impl Future<Output = Result<TokenOut, ApiError>> + Send;
  fn profiles(&self) -> impl Future<Output = Result<Vec<Profile>, ApiError>> + Send;
}

impl<T: AccountApi> AccountApi for Arc<T> {
  fn login(&self, cpf: &str) -> impl Future<Output = Result<TokenOut, ApiError>> + Send {
    (**self).login(cpf)
  }

  fn profiles(&self) -> impl Future<Output = Result<Vec<Profile>, ApiError>> + Send {
    (**self).profiles()
  }
}

#[derive(Error, Debug)]
pub enum AccountError {
  #[error("CPF inválido. Digite os 11 números do CPF.")]
  InvalidCpf,

  #[error("CPF não encontrado ou não autorizado: {0}")]
  Login(#[source] ApiError),

  #[error("Você não está cadastrado em nenhum curso com metodologia PBL ativa!")]
  NoCourses,

  #[error("Erro ao verificar status do formulário.")]
  ProfileUnavailable,

  #[error(transparent)]
  Api(#[from] ApiError),
}

impl AccountError {
  pub fn notice(&self) -> Notice {
    Notice::error(self.to_string())
  }

  pub fn route(&self) -> Option<Route> {
    match self {
      AccountError::Api(e) => e.route(),
      _ => None,
    }
  }
}

/// Outcome of a controller action: where to go next and what to tell the learner.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
  pub route: Route,
  pub notice: Option<Notice>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileView {
  pub profile: Profile,
  /// Set when the onboarding form still has to be filled.
  pub redirect: Option<Route>,
}

/// `(course, cohort)` pairs in first-seen order; rows missing either are skipped.
pub fn unique_courses(profiles: &[Profile]) -> Vec<Course> {
  let mut seen = HashSet::new();
  profiles
    .iter()
    .filter_map(|p| match (&p.course, &p.cohort) {
      (Some(name), Some(cohort)) if !name.is_empty() && !cohort.is_empty() => {
        Some(Course { name: name.clone(), cohort: cohort.clone() })
      }
      _ => None,
    })
    .filter(|c| seen.insert(c.clone()))
    .collect()
}

pub struct Account<A> {
  api: A,
  session: SessionStore,
}

impl<A: AccountApi> Account<A> {
  pub fn new(api: A, session: SessionStore) -> Self {
    Self { api, session }
  }

  pub fn session(&self) -> &SessionStore {
    &self.session
  }

  #[instrument(level = "info", skip(self, raw_cpf))]
  pub async fn login(&self, raw_cpf: &str) -> Result<Transition, AccountError> {
    let cpf = normalize_cpf(raw_cpf);
    if cpf.len() != CPF_DIGITS {
      return Err(AccountError::InvalidCpf);
    }
    let token = self.api.login(&cpf).await.map_err(|e| {
      warn!(target: "pbl_client", cpf = %mask_cpf(&cpf), error = %e, "Login failed");
      AccountError::Login(e)
    })?;
    self.session.init(Session::new(cpf, token.access_token)).await;
    Ok(Transition { route: Route::Courses, notice: Some(Notice::success("Login realizado com sucesso!")) })
  }

  pub async fn courses(&self) -> Result<Vec<Course>, AccountError> {
    self.session.require().await?;
    let courses = unique_courses(&self.api.profiles().await?);
    if courses.is_empty() {
      return Err(AccountError::NoCourses);
    }
    Ok(courses)
  }

  /// Store the choice, then send the learner to onboarding or straight to the challenges.
  #[instrument(level = "info", skip(self, course), fields(cohort = %course.cohort))]
  pub async fn select_course(&self, course: &Course) -> Result<Transition, AccountError> {
    self.session.select_course(course).await?;
    let profiles = self.api.profiles().await?;
    let row = profiles
      .iter()
      .find(|p| p.cohort.as_deref() == Some(course.cohort.as_str()))
      .or_else(|| profiles.first())
      .ok_or(AccountError::ProfileUnavailable)?;
    let route = if row.onboarding_done { Route::Challenges } else { Route::Onboarding };
    info!(target: "pbl_client", ?route, "Course selected");
    Ok(Transition { route, notice: Some(Notice::success(format!("Curso {} selecionado!", course.name))) })
  }

  pub async fn profile(&self) -> Result<ProfileView, AccountError> {
    self.session.require().await?;
    let profile = self.api.profiles().await?.into_iter().next().ok_or(AccountError::ProfileUnavailable)?;
    let redirect = (!profile.onboarding_done).then_some(Route::Onboarding);
    Ok(ProfileView { profile, redirect })
  }

  pub async fn logout(&self) -> Transition {
    self.session.clear().await;
    Transition { route: Route::Login, notice: Some(Notice::info("Sessão encerrada.")) }
  }
}
