//! PBL learner client.
//!
//! One controller per view of the learning platform:
//! - `account`    : CPF login, course selection, profile, logout
//! - `onboarding` : onboarding form, challenge generation wait
//! - `board`      : challenges view, attempts, background refresh
//! - `socket`     : push channel with heartbeat and reconnect
//!
//! Controllers talk to the platform through `api::ApiClient` and return
//! `Route`/`Notice` values instead of driving a UI.

pub mod account;
pub mod api;
pub mod board;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod onboarding;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod submission;
pub mod task;
pub mod telemetry;
pub mod tracker;
pub mod util;

#[cfg(test)]
mod testing;
