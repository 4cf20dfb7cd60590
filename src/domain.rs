//! Domain models consumed by the client: challenges, modules, attempts, profile, courses.
//!
//! Field names on the wire are the platform's (Portuguese); Rust names are ours.

use serde::{Deserialize, Serialize};

/// Macro challenges frame a whole module; micro challenges belong to one lesson.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
  Macro,
  Micro,
}

/// A challenge as listed by the API, annotated client-side with module/lesson
/// and the release flag for the learner's cohort.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
  pub id: String,
  #[serde(rename = "texto_desafio", default)]
  pub text: String,
  #[serde(rename = "tipo")]
  pub kind: ChallengeKind,
  #[serde(rename = "conteudo_id")]
  pub content_id: String,

  // Client-side annotations (see `catalog::annotate`).
  #[serde(rename = "modulo", default)]
  pub module: String,
  #[serde(rename = "aula", default)]
  pub lesson: String,
  #[serde(rename = "desafio_liberado", default)]
  pub released: bool,
}

/// A named grouping: at most one macro challenge and its ordered micro challenges.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
  pub name: String,
  pub macro_challenge: Option<Challenge>,
  pub micros: Vec<Challenge>,
}

/// Content-unit metadata used to place challenges into modules/lessons.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContentUnit {
  pub id: String,
  #[serde(rename = "modulo", default)]
  pub module: String,
  #[serde(rename = "aula", default)]
  pub lesson: String,
}

/// A content unit currently released to the requesting cohort.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
  #[serde(rename = "conteudo_id")]
  pub content_id: String,
}

/// One scored attempt as summarised by the history endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
  #[serde(rename = "desafio_id")]
  pub challenge_id: String,
  #[serde(rename = "tentativa")]
  pub attempt: u32,
  #[serde(rename = "tentativa_finalizada", default)]
  pub finalized: bool,
  #[serde(rename = "nota", default)]
  pub score: Option<f32>,
  #[serde(default)]
  pub feedback: Option<String>,
  #[serde(rename = "resposta_ideal", default)]
  pub ideal_answer: Option<String>,
}

/// Server-computed result of one submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
  #[serde(rename = "nota")]
  pub score: f32,
  #[serde(default)]
  pub feedback: String,
  #[serde(rename = "sugestao", default)]
  pub ideal_answer: Option<String>,
}

/// Learner profile. Every column is optional when the API is asked for a subset of fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
  #[serde(rename = "nome", default)]
  pub name: Option<String>,
  #[serde(default)]
  pub cpf: Option<String>,
  #[serde(rename = "curso", default)]
  pub course: Option<String>,
  #[serde(rename = "turma", default)]
  pub cohort: Option<String>,
  #[serde(rename = "cargo", default)]
  pub role: Option<String>,
  #[serde(rename = "regiao", default)]
  pub region: Option<String>,
  #[serde(rename = "cadeia", default)]
  pub supply_chain: Option<String>,
  #[serde(rename = "desafios", default)]
  pub daily_challenges: Option<String>,
  #[serde(rename = "observacoes", default)]
  pub notes: Option<String>,
  #[serde(rename = "formulario_finalizado", default)]
  pub onboarding_done: bool,
}

/// A (course, cohort) enrolment pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Course {
  pub name: String,
  pub cohort: String,
}

/// The views a controller can send the learner to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
  Login,
  Courses,
  Onboarding,
  Challenges,
  Profile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
  Success,
  Info,
  Error,
}

/// Transient, user-facing message (the web client's toast).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
  pub level: NoticeLevel,
  pub text: String,
}

impl Notice {
  pub fn success(text: impl Into<String>) -> Self { Self { level: NoticeLevel::Success, text: text.into() } }
  pub fn info(text: impl Into<String>) -> Self { Self { level: NoticeLevel::Info, text: text.into() } }
  pub fn error(text: impl Into<String>) -> Self { Self { level: NoticeLevel::Error, text: text.into() } }
}

impl std::fmt::Display for Notice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let tag = match self.level {
      NoticeLevel::Success => "ok",
      NoticeLevel::Info => "info",
      NoticeLevel::Error => "erro",
    };
    write!(f, "[{}] {}", tag, self.text)
  }
}
