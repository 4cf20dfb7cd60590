//! Typed HTTP client for the platform API.
//!
//! Every call carries the session's bearer token when one exists. A 401 clears the
//! session (live and persisted) before the error reaches the caller. Error bodies
//! are FastAPI-shaped (`detail` or `message`); anything else reports `HTTP <status>`.
//!
//! NOTE: answer text and tokens are never logged; lengths and ids are.

use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::account::AccountApi;
use crate::board::BoardApi;
use crate::config::ClientConfig;
use crate::domain::{AttemptRecord, Challenge, ContentUnit, Evaluation, Profile, Release};
use crate::error::ApiError;
use crate::onboarding::OnboardingApi;
use crate::poller::ChallengeFeed;
use crate::protocol::{
  AdminContent, AttemptIn, ErrorBody, FinalizeIn, GenerationAck, LoginForm, OneOrMany, ProfileUpdate, ReleaseIn,
  ReleaseRecord, TokenOut, TotalOut,
};
use crate::session::SessionStore;
use crate::submission::AttemptApi;
use crate::util::{mask_cpf, trunc_for_log};

const CLIENT_AGENT: &str = concat!("pbl-client/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct ApiClient {
  client: reqwest::Client,
  base_url: String,
  session: SessionStore,
}

impl ApiClient {
  pub fn new(cfg: &ClientConfig, session: SessionStore) -> Result<Self, ApiError> {
    let client = reqwest::Client::builder()
      .timeout(cfg.request_timeout())
      .build()?;
    Ok(Self { client, base_url: cfg.api_base(), session })
  }

  pub fn session(&self) -> &SessionStore {
    &self.session
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  async fn authed(&self, req: RequestBuilder) -> RequestBuilder {
    let req = req.header(USER_AGENT, CLIENT_AGENT);
    match self.session.token().await {
      Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
      None => req,
    }
  }

  /// Send with auth; map 401 and non-2xx statuses to `ApiError`.
  async fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
    let res = self.authed(req).await.send().await?;
    let status = res.status();
    if status.is_success() {
      return Ok(res);
    }
    let message = error_message(res).await;
    if status == reqwest::StatusCode::UNAUTHORIZED {
      warn!(target: "pbl_client", "Request unauthorized; clearing session");
      self.session.clear().await;
      return Err(ApiError::Unauthorized(message));
    }
    warn!(target: "pbl_client", status = status.as_u16(), message = %trunc_for_log(&message, 200), "API request failed");
    Err(ApiError::Http { status: status.as_u16(), message })
  }

  async fn get_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
    let res = self.send(req).await?;
    decode(res).await
  }

  // ---- auth ----

  /// Exchange a CPF for a bearer token. A rejected CPF is an HTTP error, not an
  /// expired session.
  #[instrument(level = "info", skip(self, cpf), fields(cpf = %mask_cpf(cpf)))]
  pub async fn login(&self, cpf: &str) -> Result<TokenOut, ApiError> {
    let res = self
      .client
      .post(self.url("/auth/token"))
      .header(USER_AGENT, CLIENT_AGENT)
      .form(&LoginForm { username: cpf, password: "" })
      .send()
      .await?;
    let status = res.status();
    if !status.is_success() {
      let message = error_message(res).await;
      warn!(target: "pbl_client", status = status.as_u16(), "Login rejected");
      return Err(ApiError::Http { status: status.as_u16(), message });
    }
    decode(res).await
  }

  // ---- learner ----

  #[instrument(level = "debug", skip(self))]
  pub async fn list_challenges(&self) -> Result<Vec<Challenge>, ApiError> {
    let list: Vec<Challenge> = self.get_json(self.client.get(self.url("/api/desafios"))).await?;
    debug!(target: "challenge", count = list.len(), "Challenges listed");
    Ok(list)
  }

  #[instrument(level = "debug", skip(self))]
  pub async fn releases(&self, cohort: &str) -> Result<Vec<Release>, ApiError> {
    self
      .get_json(self.client.get(self.url("/api/liberacoes")).query(&[("turma", cohort)]))
      .await
  }

  /// Content metadata; falls back to the admin listing when the public one fails.
  #[instrument(level = "debug", skip(self))]
  pub async fn content_units(&self) -> Result<Vec<ContentUnit>, ApiError> {
    match self.get_json::<Vec<ContentUnit>>(self.client.get(self.url("/api/conteudos"))).await {
      Ok(units) => Ok(units),
      Err(e) if e.is_unauthorized() => Err(e),
      Err(e) => {
        debug!(target: "pbl_client", error = %e, "Public content listing failed; trying admin listing");
        let admin = self.admin_contents().await?;
        Ok(admin.into_iter().map(|c| ContentUnit { id: c.id, module: c.module, lesson: c.lesson }).collect())
      }
    }
  }

  #[instrument(level = "info", skip(self, body), fields(challenge_id = %body.challenge_id, attempt = body.attempt, answer_len = body.answer.len()))]
  pub async fn submit_attempt(&self, body: &AttemptIn) -> Result<Evaluation, ApiError> {
    let req = self.client.post(self.url("/api/respostas/registrar")).json(body);
    let ev: Evaluation = self.get_json(req).await?;
    info!(target: "challenge", score = %format!("{:.1}", ev.score), "Attempt scored");
    Ok(ev)
  }

  #[instrument(level = "info", skip(self, body), fields(challenge_id = %body.challenge_id, attempt = body.attempt))]
  pub async fn finalize_attempt(&self, body: &FinalizeIn) -> Result<(), ApiError> {
    self.send(self.client.post(self.url("/api/respostas/finalizar")).json(body)).await?;
    Ok(())
  }

  #[instrument(level = "debug", skip(self))]
  pub async fn attempt_history(&self) -> Result<Vec<AttemptRecord>, ApiError> {
    self.get_json(self.client.get(self.url("/api/respostas/resumo"))).await
  }

  /// The learner's profile rows; one per enrolment.
  #[instrument(level = "debug", skip(self))]
  pub async fn profiles(&self) -> Result<Vec<Profile>, ApiError> {
    let rows: OneOrMany<Profile> = self.get_json(self.client.get(self.url("/api/usuarios"))).await?;
    Ok(rows.into_vec())
  }

  pub async fn profile(&self) -> Result<Profile, ApiError> {
    self
      .profiles()
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| ApiError::Decode("perfil vazio".into()))
  }

  #[instrument(level = "info", skip(self, body))]
  pub async fn update_profile(&self, body: &ProfileUpdate) -> Result<(), ApiError> {
    self.send(self.client.post(self.url("/api/usuarios")).json(body)).await?;
    Ok(())
  }

  #[instrument(level = "info", skip(self, cpf), fields(cpf = %mask_cpf(cpf)))]
  pub async fn request_generation(&self, cpf: &str) -> Result<GenerationAck, ApiError> {
    let res = self.send(self.client.post(self.url(&format!("/api/desafios/gerar/{}", cpf)))).await?;
    // Some deployments answer 202 with an empty body.
    let body = res.text().await?;
    if body.trim().is_empty() {
      return Ok(GenerationAck::default());
    }
    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
  }

  // ---- admin ----

  pub async fn admin_contents(&self) -> Result<Vec<AdminContent>, ApiError> {
    self.get_json(self.client.get(self.url("/api/admin/conteudos"))).await
  }

  pub async fn cohorts(&self) -> Result<Vec<String>, ApiError> {
    self.get_json(self.client.get(self.url("/api/admin/turmas"))).await
  }

  #[instrument(level = "info", skip(self, body), fields(content_id = %body.content_id, cohorts = body.cohorts.len()))]
  pub async fn release(&self, body: &ReleaseIn) -> Result<ReleaseRecord, ApiError> {
    self.get_json(self.client.post(self.url("/api/admin/liberar")).json(body)).await
  }

  pub async fn release_history(&self) -> Result<Vec<ReleaseRecord>, ApiError> {
    self.get_json(self.client.get(self.url("/api/admin/liberacoes-historico"))).await
  }

  pub async fn user_total(&self) -> Result<u64, ApiError> {
    let out: TotalOut = self.get_json(self.client.get(self.url("/api/admin/usuarios/total"))).await?;
    Ok(out.total)
  }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
  let body = res.text().await?;
  serde_json::from_str(&body).map_err(|e| {
    warn!(target: "pbl_client", error = %e, body = %trunc_for_log(&body, 200), "Undecodable response");
    ApiError::Decode(e.to_string())
  })
}

async fn error_message(res: Response) -> String {
  let status = res.status();
  let body = res.text().await.unwrap_or_default();
  serde_json::from_str::<ErrorBody>(&body)
    .ok()
    .and_then(|b| b.text())
    .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

impl AccountApi for ApiClient {
  async fn login(&self, cpf: &str) -> Result<TokenOut, ApiError> {
    ApiClient::login(self, cpf).await
  }

  async fn profiles(&self) -> Result<Vec<Profile>, ApiError> {
    ApiClient::profiles(self).await
  }
}

impl AttemptApi for ApiClient {
  async fn submit_attempt(&self, body: &AttemptIn) -> Result<Evaluation, ApiError> {
    ApiClient::submit_attempt(self, body).await
  }

  async fn finalize_attempt(&self, body: &FinalizeIn) -> Result<(), ApiError> {
    ApiClient::finalize_attempt(self, body).await
  }

  async fn attempt_history(&self) -> Result<Vec<AttemptRecord>, ApiError> {
    ApiClient::attempt_history(self).await
  }
}

impl ChallengeFeed for ApiClient {
  async fn list_challenges(&self) -> Result<Vec<Challenge>, ApiError> {
    ApiClient::list_challenges(self).await
  }
}

impl BoardApi for ApiClient {
  async fn releases(&self, cohort: &str) -> Result<Vec<Release>, ApiError> {
    ApiClient::releases(self, cohort).await
  }

  async fn content_units(&self) -> Result<Vec<ContentUnit>, ApiError> {
    ApiClient::content_units(self).await
  }
}

impl OnboardingApi for ApiClient {
  async fn update_profile(&self, body: &ProfileUpdate) -> Result<(), ApiError> {
    ApiClient::update_profile(self, body).await
  }

  async fn request_generation(&self, cpf: &str) -> Result<(), ApiError> {
    let ack = ApiClient::request_generation(self, cpf).await?;
    debug!(target: "challenge", status = ?ack.status, "Generation requested");
    Ok(())
  }
}
