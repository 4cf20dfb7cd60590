//! Learner session: created at login, torn down at logout or on any 401.
//!
//! Only two identity strings (CPF and cohort) outlive the process, in a small JSON
//! file. The bearer token stays in memory; the CLI re-authenticates from the stored
//! CPF on each run.

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::domain::Course;
use crate::error::ApiError;
use crate::util::mask_cpf;

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
  pub cpf: String,
  pub token: String,
  pub course: Option<String>,
  pub cohort: Option<String>,
}

impl Session {
  pub fn new(cpf: impl Into<String>, token: impl Into<String>) -> Self {
    Self { cpf: cpf.into(), token: token.into(), course: None, cohort: None }
  }
}

/// What is kept on disk between runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredIdentity {
  #[serde(default)]
  pub cpf: Option<String>,
  #[serde(rename = "turma", default)]
  pub cohort: Option<String>,
}

#[derive(Clone)]
pub struct SessionStore {
  inner: Arc<RwLock<Option<Session>>>,
  path: Option<PathBuf>,
}

impl SessionStore {
  pub fn in_memory() -> Self {
    Self { inner: Arc::new(RwLock::new(None)), path: None }
  }

  pub fn persistent(path: impl Into<PathBuf>) -> Self {
    Self { inner: Arc::new(RwLock::new(None)), path: Some(path.into()) }
  }

  /// Start a session (login). Keeps a previously stored cohort for the same CPF.
  #[instrument(level = "debug", skip(self, session), fields(cpf = %mask_cpf(&session.cpf)))]
  pub async fn init(&self, mut session: Session) {
    if session.cohort.is_none() {
      let stored = self.stored_identity().await;
      if stored.cpf.as_deref() == Some(session.cpf.as_str()) {
        session.cohort = stored.cohort;
      }
    }
    let identity = StoredIdentity { cpf: Some(session.cpf.clone()), cohort: session.cohort.clone() };
    *self.inner.write().await = Some(session);
    self.persist(&identity).await;
    info!(target: "pbl_client", "Session started");
  }

  /// Record the selected course/cohort on the live session.
  pub async fn select_course(&self, course: &Course) -> Result<(), ApiError> {
    let identity = {
      let mut guard = self.inner.write().await;
      let session = guard.as_mut().ok_or(ApiError::NoSession)?;
      session.course = Some(course.name.clone());
      session.cohort = Some(course.cohort.clone());
      StoredIdentity { cpf: Some(session.cpf.clone()), cohort: Some(course.cohort.clone()) }
    };
    self.persist(&identity).await;
    debug!(target: "pbl_client", cohort = %course.cohort, "Course selected");
    Ok(())
  }

  pub async fn current(&self) -> Option<Session> {
    self.inner.read().await.clone()
  }

  pub async fn require(&self) -> Result<Session, ApiError> {
    self.current().await.ok_or(ApiError::NoSession)
  }

  pub async fn token(&self) -> Option<String> {
    self.inner.read().await.as_ref().map(|s| s.token.clone())
  }

  /// Teardown: forget the live session and the stored identity.
  #[instrument(level = "debug", skip(self))]
  pub async fn clear(&self) {
    let had_session = self.inner.write().await.take().is_some();
    if let Some(path) = &self.path {
      match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "pbl_client", path = %path.display(), error = %e, "Failed to remove stored identity"),
      }
    }
    if had_session {
      info!(target: "pbl_client", "Session cleared");
    }
  }

  /// Identity left by a previous run, if any. Unreadable files count as empty.
  pub async fn stored_identity(&self) -> StoredIdentity {
    let Some(path) = &self.path else { return StoredIdentity::default() };
    match tokio::fs::read_to_string(path).await {
      Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
        warn!(target: "pbl_client", path = %path.display(), error = %e, "Ignoring malformed stored identity");
        StoredIdentity::default()
      }),
      Err(_) => StoredIdentity::default(),
    }
  }

  async fn persist(&self, identity: &StoredIdentity) {
    let Some(path) = &self.path else { return };
    let body = match serde_json::to_string_pretty(identity) {
      Ok(b) => b,
      Err(e) => {
        warn!(target: "pbl_client", error = %e, "Failed to encode identity");
        return;
      }
    };
    if let Err(e) = tokio::fs::write(path, body).await {
      warn!(target: "pbl_client", path = %path.display(), error = %e, "Failed to persist identity");
    }
  }
}
