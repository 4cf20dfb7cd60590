use thiserror::Error;

use crate::domain::{Notice, Route};

/// Failures talking to the platform API.
#[derive(Error, Debug)]
pub enum ApiError {
  /// 401: the session has already been cleared when this is returned.
  #[error("Sessão expirada: {0}")]
  Unauthorized(String),

  #[error("{message}")]
  Http { status: u16, message: String },

  #[error("Falha de rede: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("Resposta inesperada do servidor: {0}")]
  Decode(String),

  #[error("Nenhuma sessão ativa. Faça login com seu CPF.")]
  NoSession,
}

impl ApiError {
  pub fn is_unauthorized(&self) -> bool {
    matches!(self, ApiError::Unauthorized(_) | ApiError::NoSession)
  }

  /// Where the learner should go after this error, if anywhere.
  pub fn route(&self) -> Option<Route> {
    if self.is_unauthorized() { Some(Route::Login) } else { None }
  }

  pub fn notice(&self) -> Notice {
    Notice::error(self.to_string())
  }
}
