//! Client configuration: API/WebSocket endpoints, session file and timing knobs.
//!
//! Sources, later wins:
//!   1. built-in defaults (the platform's reference timings)
//!   2. TOML file named by PBL_CONFIG_PATH
//!   3. env overrides: PBL_API_URL, PBL_WS_URL, PBL_SESSION_PATH
//!   4. CLI flags (applied by the binary)
//!
//! Example TOML:
//! ```toml
//! api_url = "https://pbl.example.com"
//! [poller]
//! interval_ms = 3000
//! ceiling_ms = 90000
//! [socket]
//! heartbeat_ms = 15000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::util::derive_ws_url;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub api_url: String,
  /// Explicit WebSocket endpoint; derived from `api_url` + "/ws" when absent.
  pub ws_url: Option<String>,
  /// Where the two identity strings (CPF, cohort) are kept between runs.
  pub session_path: PathBuf,
  pub request_timeout_secs: u64,
  pub poller: PollerConfig,
  pub socket: SocketConfig,
  pub board: BoardConfig,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      api_url: "http://localhost:8000".into(),
      ws_url: None,
      session_path: PathBuf::from(".pbl-session.json"),
      request_timeout_secs: 20,
      poller: PollerConfig::default(),
      socket: SocketConfig::default(),
      board: BoardConfig::default(),
    }
  }
}

/// Generation poller timing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
  pub interval_ms: u64,
  pub ceiling_ms: u64,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self { interval_ms: 3_000, ceiling_ms: 90_000 }
  }
}

impl PollerConfig {
  /// Never zero: tokio intervals reject a zero period.
  pub fn interval(&self) -> Duration { Duration::from_millis(self.interval_ms.max(1)) }
  pub fn ceiling(&self) -> Duration { Duration::from_millis(self.ceiling_ms) }
}

/// Reconnecting socket timing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
  pub heartbeat_ms: u64,
  pub backoff_base_ms: u64,
  pub backoff_ceiling_ms: u64,
}

impl Default for SocketConfig {
  fn default() -> Self {
    Self { heartbeat_ms: 15_000, backoff_base_ms: 1_000, backoff_ceiling_ms: 30_000 }
  }
}

impl SocketConfig {
  pub fn heartbeat(&self) -> Duration { Duration::from_millis(self.heartbeat_ms.max(1)) }
  pub fn backoff_base(&self) -> Duration { Duration::from_millis(self.backoff_base_ms) }
  pub fn backoff_ceiling(&self) -> Duration { Duration::from_millis(self.backoff_ceiling_ms) }
}

/// Challenge board background refresh.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
  pub refresh_ms: u64,
}

impl Default for BoardConfig {
  fn default() -> Self {
    Self { refresh_ms: 1_000 }
  }
}

impl BoardConfig {
  pub fn refresh(&self) -> Duration { Duration::from_millis(self.refresh_ms.max(1)) }
}

impl ClientConfig {
  /// Defaults, then PBL_CONFIG_PATH, then env overrides.
  pub fn load() -> Self {
    let mut cfg = load_config_from_env().unwrap_or_default();
    cfg.apply_env_overrides();
    cfg
  }

  pub fn apply_env_overrides(&mut self) {
    if let Ok(url) = std::env::var("PBL_API_URL") {
      if !url.trim().is_empty() { self.api_url = url; }
    }
    if let Ok(url) = std::env::var("PBL_WS_URL") {
      if !url.trim().is_empty() { self.ws_url = Some(url); }
    }
    if let Ok(path) = std::env::var("PBL_SESSION_PATH") {
      if !path.trim().is_empty() { self.session_path = PathBuf::from(path); }
    }
  }

  /// API base without trailing slash.
  pub fn api_base(&self) -> String {
    self.api_url.trim_end_matches('/').to_string()
  }

  /// Explicit `ws_url` if set, else `api_url` with the scheme swapped and "/ws" appended.
  pub fn ws_endpoint(&self) -> String {
    match &self.ws_url {
      Some(url) => url.trim_end_matches('/').to_string(),
      None => derive_ws_url(&self.api_url),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs.max(1))
  }
}

/// Attempt to load `ClientConfig` from PBL_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_config_from_env() -> Option<ClientConfig> {
  let path = std::env::var("PBL_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<ClientConfig>(&s) {
      Ok(cfg) => {
        info!(target: "pbl_client", %path, "Loaded client config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "pbl_client", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "pbl_client", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
