//! The challenges view: loads and annotates the learner's challenges, keeps them
//! fresh in the background, and routes answers through the submission pipeline.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{self, LessonBadge};
use crate::config::BoardConfig;
use crate::domain::{Challenge, ContentUnit, Module, Notice, Release, Route};
use crate::error::ApiError;
use crate::poller::ChallengeFeed;
use crate::session::SessionStore;
use crate::submission::{AnswerDraft, AttemptApi, SubmissionError, SubmissionOutcome, SubmissionPipeline};
use crate::task::ScheduledTask;
use crate::tracker::AttemptStatus;

/// Everything the board reads from the API.
pub trait BoardApi: AttemptApi + ChallengeFeed {
  fn releases(&self, cohort: &str) -> impl Future<Output = Result<Vec<Release>, ApiError>> + Send;
  fn content_units(&self) -> impl Future<Output = Result<Vec<ContentUnit>, ApiError>> + Send;
}

impl<T: BoardApi> BoardApi for Arc<T> {
  fn releases(&self, cohort: &str) -> impl Future<Output = Result<Vec<Release>, ApiError>> + Send {
    (**self).releases(cohort)
  }

  fn content_units(&self) -> impl Future<Output = Result<Vec<ContentUnit>, ApiError>> + Send {
    (**self).content_units()
  }
}

#[derive(Error, Debug)]
pub enum BoardError {
  #[error("Nenhuma turma selecionada. Escolha um curso primeiro.")]
  NoCohort,

  #[error("Falha ao carregar os desafios: {0}")]
  Load(#[source] ApiError),

  #[error("Desafio não encontrado: {0}")]
  UnknownChallenge(String),

  #[error("Este desafio ainda aguarda liberação.")]
  NotReleased,

  #[error(transparent)]
  Submission(#[from] SubmissionError),
}

impl BoardError {
  pub fn notice(&self) -> Notice {
    Notice::error(self.to_string())
  }

  pub fn route(&self) -> Option<Route> {
    match self {
      BoardError::NoCohort => Some(Route::Courses),
      BoardError::Load(e) => e.route(),
      BoardError::Submission(SubmissionError::Request(e)) => e.route(),
      _ => None,
    }
  }
}

/// One challenge with everything the view shows next to it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChallengeView {
  pub challenge: Challenge,
  pub status: AttemptStatus,
  pub badge: LessonBadge,
  pub feedback: Option<String>,
}

struct BoardShared<A> {
  pipeline: SubmissionPipeline<A>,
  cohort: String,
  challenges: RwLock<Vec<Challenge>>,
}

impl<A: BoardApi> BoardShared<A> {
  async fn fetch_annotated(&self, listed: Vec<Challenge>) -> Result<Vec<Challenge>, ApiError> {
    let api = self.pipeline.api();
    let (releases, contents) = tokio::try_join!(api.releases(&self.cohort), api.content_units())?;
    let known = self.challenges.read().await.clone();
    let merged = catalog::merge_preserving_text(&known, listed);
    Ok(catalog::annotate(merged, &releases, &contents))
  }

  async fn reload(&self) -> Result<usize, ApiError> {
    let listed = self.pipeline.api().list_challenges().await?;
    let annotated = self.fetch_annotated(listed).await?;
    let n = annotated.len();
    *self.challenges.write().await = annotated;
    Ok(n)
  }

  /// Re-annotate only when the learner's challenge count grew. Errors are swallowed.
  async fn refresh_if_grown(&self) -> bool {
    let listed = match self.pipeline.api().list_challenges().await {
      Ok(l) => l,
      Err(e) => {
        debug!(target: "challenge", error = %e, "Background challenge count failed");
        return false;
      }
    };
    let known = self.challenges.read().await.len();
    if listed.len() <= known {
      return false;
    }
    match self.fetch_annotated(listed).await {
      Ok(annotated) => {
        info!(target: "challenge", before = known, after = annotated.len(), "New challenges arrived");
        *self.challenges.write().await = annotated;
        true
      }
      Err(e) => {
        debug!(target: "challenge", error = %e, "Background re-annotation failed");
        false
      }
    }
  }
}

pub struct ChallengeBoard<A> {
  shared: Arc<BoardShared<A>>,
  refresher: Option<ScheduledTask>,
}

impl<A: BoardApi + 'static> ChallengeBoard<A> {
  /// Load the view for the session's cohort and start the background refresh.
  #[instrument(level = "info", skip(api, session, cfg))]
  pub async fn mount(api: A, session: &SessionStore, cfg: &BoardConfig) -> Result<Self, BoardError> {
    let board = Self::load(api, session).await?;
    Ok(board.with_refresh(cfg))
  }

  /// Load without a background refresh (one-shot views such as the CLI).
  pub async fn load(api: A, session: &SessionStore) -> Result<Self, BoardError> {
    let current = session.require().await.map_err(BoardError::Load)?;
    let cohort = current.cohort.filter(|c| !c.trim().is_empty()).ok_or(BoardError::NoCohort)?;

    let shared = Arc::new(BoardShared {
      pipeline: SubmissionPipeline::new(api, current.cpf),
      cohort,
      challenges: RwLock::new(Vec::new()),
    });
    let count = shared.reload().await.map_err(BoardError::Load)?;
    shared.pipeline.refresh().await.map_err(BoardError::Load)?;
    info!(target: "challenge", cohort = %shared.cohort, count, "Challenge board loaded");
    Ok(Self { shared, refresher: None })
  }

  fn with_refresh(mut self, cfg: &BoardConfig) -> Self {
    let shared = self.shared.clone();
    self.refresher = Some(ScheduledTask::every("board-refresh", cfg.refresh(), move || {
      let shared = shared.clone();
      async move {
        shared.refresh_if_grown().await;
      }
    }));
    self
  }

  /// Stop the background refresh. Also happens on drop.
  pub async fn unmount(mut self) {
    if let Some(task) = self.refresher.take() {
      task.cancel().await;
    }
  }

  pub fn cohort(&self) -> &str {
    &self.shared.cohort
  }

  pub fn pipeline(&self) -> &SubmissionPipeline<A> {
    &self.shared.pipeline
  }

  pub async fn challenges(&self) -> Vec<Challenge> {
    self.shared.challenges.read().await.clone()
  }

  pub async fn modules(&self) -> Vec<Module> {
    catalog::group_modules(&self.shared.challenges.read().await)
  }

  pub async fn view(&self, challenge_id: &str) -> Option<ChallengeView> {
    let challenge = self.shared.challenges.read().await.iter().find(|c| c.id == challenge_id).cloned()?;
    let status = self.shared.pipeline.status(challenge_id).await;
    Some(ChallengeView {
      badge: catalog::lesson_badge(&challenge, &status),
      feedback: catalog::feedback_text(&status),
      challenge,
      status,
    })
  }

  /// Full refetch of challenges and history.
  pub async fn reload(&self) -> Result<(), BoardError> {
    self.shared.reload().await.map_err(BoardError::Load)?;
    self.shared.pipeline.refresh().await.map_err(BoardError::Load)
  }

  /// One background-refresh step; true when the board changed.
  pub async fn refresh_if_grown(&self) -> bool {
    self.shared.refresh_if_grown().await
  }

  pub async fn submit(&self, challenge_id: &str, draft: &mut AnswerDraft) -> Result<SubmissionOutcome, BoardError> {
    self.require_released(challenge_id).await?;
    match self.shared.pipeline.submit(challenge_id, draft).await {
      Ok(out) => Ok(out),
      Err(e) => {
        if !e.is_local() {
          warn!(target: "challenge", %challenge_id, error = %e, "Submission failed");
        }
        Err(e.into())
      }
    }
  }

  pub async fn finalize(&self, challenge_id: &str) -> Result<AttemptStatus, BoardError> {
    self.require_released(challenge_id).await?;
    Ok(self.shared.pipeline.finalize(challenge_id).await?)
  }

  async fn require_released(&self, challenge_id: &str) -> Result<(), BoardError> {
    let list = self.shared.challenges.read().await;
    let ch = list
      .iter()
      .find(|c| c.id == challenge_id)
      .ok_or_else(|| BoardError::UnknownChallenge(challenge_id.to_string()))?;
    if ch.released { Ok(()) } else { Err(BoardError::NotReleased) }
  }
}
