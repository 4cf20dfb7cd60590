//! Wire DTOs for the platform's HTTP API (serde ready).
//! Domain records live in `domain`; this module holds request bodies and envelopes.

use serde::{Deserialize, Serialize};

//
// Auth
//

/// OAuth2 password-form login: the CPF goes in `username`, the password is unused.
#[derive(Debug, Serialize)]
pub struct LoginForm<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenOut {
  pub access_token: String,
  #[serde(default)]
  pub token_type: Option<String>,
}

//
// Attempts
//

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AttemptIn {
  pub cpf: String,
  #[serde(rename = "desafio_id")]
  pub challenge_id: String,
  #[serde(rename = "resposta")]
  pub answer: String,
  #[serde(rename = "tentativa")]
  pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FinalizeIn {
  pub cpf: String,
  #[serde(rename = "desafio_id")]
  pub challenge_id: String,
  #[serde(rename = "tentativa")]
  pub attempt: u32,
}

//
// Profile / onboarding
//

/// Partial profile update; unset fields are not sent.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProfileUpdate {
  #[serde(rename = "cargo", skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
  #[serde(rename = "regiao", skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(rename = "cadeia", skip_serializing_if = "Option::is_none")]
  pub supply_chain: Option<String>,
  #[serde(rename = "desafios", skip_serializing_if = "Option::is_none")]
  pub daily_challenges: Option<String>,
  #[serde(rename = "observacoes", skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
  #[serde(rename = "formulario_finalizado", skip_serializing_if = "Option::is_none")]
  pub onboarding_done: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct GenerationAck {
  #[serde(default)]
  pub status: Option<String>,
  #[serde(rename = "mensagem", default)]
  pub message: Option<String>,
}

/// Some endpoints answer with a bare object where a list is expected.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
  Many(Vec<T>),
  One(T),
}

impl<T> OneOrMany<T> {
  pub fn into_vec(self) -> Vec<T> {
    match self {
      OneOrMany::Many(v) => v,
      OneOrMany::One(t) => vec![t],
    }
  }
}

//
// Admin
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminContent {
  pub id: String,
  #[serde(rename = "modulo", default)]
  pub module: String,
  #[serde(rename = "aula", default)]
  pub lesson: String,
  #[serde(rename = "ativo", default)]
  pub active: Option<bool>,
}

/// Release a content unit to cohorts at an ISO-8601 instant.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReleaseIn {
  #[serde(rename = "conteudo_id")]
  pub content_id: String,
  #[serde(rename = "modulo")]
  pub module: String,
  #[serde(rename = "aula")]
  pub lesson: String,
  #[serde(rename = "turmas")]
  pub cohorts: Vec<String>,
  pub data_iso: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReleaseRecord {
  #[serde(default)]
  pub id: Option<serde_json::Value>,
  #[serde(rename = "conteudo_id")]
  pub content_id: String,
  #[serde(rename = "modulo", default)]
  pub module: String,
  #[serde(rename = "aula", default)]
  pub lesson: String,
  #[serde(rename = "turmas", default)]
  pub cohorts: Vec<String>,
  #[serde(rename = "data_liberacao", default)]
  pub date: Option<String>,
  #[serde(rename = "hora_liberacao", default)]
  pub time: Option<String>,
  #[serde(rename = "liberado", default)]
  pub released: bool,
}

#[derive(Debug, Deserialize)]
pub struct TotalOut {
  pub total: u64,
}

/// FastAPI error envelope: `detail` may be a string or a validation list.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
  #[serde(default)]
  pub detail: Option<serde_json::Value>,
  #[serde(default)]
  pub message: Option<String>,
}

impl ErrorBody {
  pub fn text(&self) -> Option<String> {
    match &self.detail {
      Some(serde_json::Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
      Some(serde_json::Value::Array(items)) => {
        let msgs: Vec<String> = items
          .iter()
          .filter_map(|i| i.get("msg").and_then(|m| m.as_str()).map(str::to_string))
          .collect();
        if !msgs.is_empty() {
          return Some(msgs.join("; "));
        }
      }
      _ => {}
    }
    self.message.clone().filter(|m| !m.trim().is_empty())
  }
}
