//! pbl-client · terminal front end for the PBL learning platform
//!
//! Each subcommand plays one view of the web client (login, courses, profile,
//! onboarding form, challenges, admin panel).
//!
//! Important env variables:
//!   PBL_CONFIG_PATH  : path to TOML config (endpoints + timings)
//!   PBL_API_URL      : API base URL (default "http://localhost:8000")
//!   PBL_WS_URL       : WebSocket endpoint (default derived from the API URL)
//!   PBL_SESSION_PATH : where CPF and cohort are remembered between runs
//!   LOG_LEVEL        : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT       : "pretty" (default) or "json"

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::{info, instrument};

use pbl_client::account::Account;
use pbl_client::api::ApiClient;
use pbl_client::board::ChallengeBoard;
use pbl_client::catalog;
use pbl_client::config::ClientConfig;
use pbl_client::domain::{Notice, Route};
use pbl_client::onboarding::{self, Consent, Onboarding, OnboardingForm};
use pbl_client::poller::PollOutcome;
use pbl_client::protocol::ReleaseIn;
use pbl_client::session::{Session, SessionStore};
use pbl_client::socket::{Inbound, SocketHandle};
use pbl_client::submission::AnswerDraft;
use pbl_client::telemetry;
use pbl_client::tracker::MAX_ATTEMPTS;

#[derive(Parser, Debug)]
#[command(name = "pbl-client", version, about = "Cliente de terminal da plataforma PBL")]
struct Cli {
  /// API base URL (overrides config and PBL_API_URL)
  #[arg(long, global = true)]
  api_url: Option<String>,

  /// WebSocket endpoint (overrides config and PBL_WS_URL)
  #[arg(long, global = true)]
  ws_url: Option<String>,

  /// File holding the remembered CPF and cohort
  #[arg(long, global = true)]
  session_path: Option<PathBuf>,

  /// Debug-level logs with file/line
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in with a CPF (punctuation is ignored)
  Login { cpf: String },
  /// Forget the session and the remembered identity
  Logout,
  /// List the courses/cohorts you are enrolled in
  Courses,
  /// Choose the course by cohort id (or by its number in `courses`)
  Select { cohort: String },
  /// Show your profile
  Profile,
  /// Fill the onboarding form and wait for your challenges
  Onboard(OnboardArgs),
  /// List modules, lessons and their status
  Challenges,
  /// Show one challenge with attempts and feedback
  Show { id: String },
  /// Submit an answer for a challenge
  Submit { id: String, answer: String },
  /// Mark the latest attempt as your final answer
  Finalize { id: String },
  /// Stay connected to the push channel and print incoming messages
  Listen,
  /// Admin panel
  #[command(subcommand)]
  Admin(AdminCommand),
}

#[derive(Args, Debug)]
struct OnboardArgs {
  #[arg(long, default_value = "")]
  role: String,
  #[arg(long, default_value = "")]
  region: String,
  #[arg(long, default_value = "")]
  supply_chain: String,
  #[arg(long, default_value = "")]
  daily_challenges: String,
  #[arg(long, default_value = "")]
  notes: String,
  /// Agree to the use of the data for personalising challenges
  #[arg(long)]
  agree: bool,
  /// Send even if some fields are blank
  #[arg(short, long)]
  yes: bool,
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
  /// Active content units
  Contents,
  /// Known cohorts
  Cohorts,
  /// Latest releases
  History,
  /// Release a content unit to cohorts
  Release {
    #[arg(long)]
    content: String,
    #[arg(long)]
    module: String,
    #[arg(long)]
    lesson: String,
    #[arg(long = "cohort", required = true)]
    cohorts: Vec<String>,
    /// ISO-8601 instant, e.g. 2026-03-01T08:00:00Z
    #[arg(long)]
    at: String,
  },
  /// Number of registered learners
  Users,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
  let cli = Cli::parse();
  telemetry::init_tracing(cli.verbose);

  let mut cfg = ClientConfig::load();
  if let Some(url) = cli.api_url.clone() { cfg.api_url = url; }
  if let Some(url) = cli.ws_url.clone() { cfg.ws_url = Some(url); }
  if let Some(path) = cli.session_path.clone() { cfg.session_path = path; }

  let store = SessionStore::persistent(cfg.session_path.clone());
  let api = ApiClient::new(&cfg, store.clone())?;
  info!(target: "pbl_client", api = %api.base_url(), "Client ready");

  run(cli.command, &cfg, api, store).await
}

#[instrument(level = "debug", skip_all)]
async fn run(command: Command, cfg: &ClientConfig, api: ApiClient, store: SessionStore) -> CliResult {
  match command {
    Command::Login { cpf } => {
      let account = Account::new(api, store);
      match account.login(&cpf).await {
        Ok(t) => done(t.notice, Some(t.route)),
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Logout => {
      let t = Account::new(api, store).logout().await;
      done(t.notice, Some(t.route))
    }
    Command::Courses => {
      resume(&api, &store).await;
      match Account::new(api, store).courses().await {
        Ok(courses) => {
          for (i, c) in courses.iter().enumerate() {
            println!("{:>2}. {} (turma {})", i + 1, c.name, c.cohort);
          }
          Ok(())
        }
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Select { cohort } => {
      resume(&api, &store).await;
      let account = Account::new(api, store);
      let courses = match account.courses().await {
        Ok(c) => c,
        Err(e) => fail(e.notice(), e.route()),
      };
      let chosen = courses
        .iter()
        .find(|c| c.cohort == cohort)
        .or_else(|| cohort.parse::<usize>().ok().and_then(|n| n.checked_sub(1)).and_then(|i| courses.get(i)));
      let Some(course) = chosen else {
        fail(Notice::error(format!("Turma {} não encontrada.", cohort)), Some(Route::Courses));
      };
      match account.select_course(course).await {
        Ok(t) => done(t.notice, Some(t.route)),
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Profile => {
      resume(&api, &store).await;
      match Account::new(api, store).profile().await {
        Ok(view) => {
          let p = &view.profile;
          let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".into());
          println!("Nome:     {}", field(&p.name));
          println!("Curso:    {}", field(&p.course));
          println!("Turma:    {}", field(&p.cohort));
          println!("Cargo:    {}", field(&p.role));
          println!("Região:   {}", field(&p.region));
          println!("Cadeia:   {}", field(&p.supply_chain));
          println!("Desafios: {}", field(&p.daily_challenges));
          println!("Obs.:     {}", field(&p.notes));
          if let Some(route) = view.redirect {
            done(Some(Notice::info("Complete o formulário inicial para gerar seus desafios.")), Some(route))
          } else {
            Ok(())
          }
        }
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Onboard(args) => {
      resume(&api, &store).await;
      let form = OnboardingForm {
        role: args.role,
        region: args.region,
        supply_chain: args.supply_chain,
        daily_challenges: args.daily_challenges,
        notes: args.notes,
      };
      println!("Preenchimento: {}%", form.fill_percent());
      let flow = Onboarding::new(api, store, cfg.poller.clone());
      let handle = match flow.submit(&form, Consent { data_use: args.agree, incomplete_ok: args.yes }).await {
        Ok(h) => h,
        Err(e) => fail(e.notice(), e.route()),
      };
      println!("{}", onboarding::submitted_notice());
      let outcome = tokio::select! {
        o = handle.outcome() => o,
        _ = tokio::signal::ctrl_c() => PollOutcome::Cancelled,
      };
      let (notice, route) = onboarding::finish(&outcome);
      done(notice, route)
    }
    Command::Challenges => {
      resume(&api, &store).await;
      let board = load_board(api, &store).await;
      for module in board.modules().await {
        println!("== {} ==", module.name);
        let lessons = module.macro_challenge.iter().chain(module.micros.iter());
        for ch in lessons {
          let status = board.pipeline().status(&ch.id).await;
          let badge = catalog::lesson_badge(ch, &status);
          let lesson = if ch.lesson.is_empty() { "Desafio do módulo" } else { ch.lesson.as_str() };
          println!("  {:<28} {:<22} {}/{}  [{}]", lesson, badge.label(), status.count, MAX_ATTEMPTS, ch.id);
        }
      }
      Ok(())
    }
    Command::Show { id } => {
      resume(&api, &store).await;
      let board = load_board(api, &store).await;
      let Some(view) = board.view(&id).await else {
        fail(Notice::error(format!("Desafio não encontrado: {}", id)), Some(Route::Challenges));
      };
      println!("{} · {} · {}", view.challenge.module, view.challenge.lesson, view.badge.label());
      println!();
      println!("{}", view.challenge.text);
      println!();
      println!("Tentativas realizadas: {} / {}", view.status.count, MAX_ATTEMPTS);
      if let Some(text) = view.feedback {
        println!();
        println!("{}", text);
      }
      Ok(())
    }
    Command::Submit { id, answer } => {
      resume(&api, &store).await;
      let board = load_board(api, &store).await;
      let mut draft = AnswerDraft::new(answer);
      match board.submit(&id, &mut draft).await {
        Ok(out) => {
          println!("{}", out.notice());
          if let Some(text) = board.view(&id).await.and_then(|v| v.feedback) {
            println!();
            println!("{}", text);
          }
          if out.status.finalized {
            println!();
            println!("Desafio finalizado!");
          } else {
            println!();
            println!("Tentativas restantes: {}", out.status.remaining());
          }
          Ok(())
        }
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Finalize { id } => {
      resume(&api, &store).await;
      let board = load_board(api, &store).await;
      match board.finalize(&id).await {
        Ok(_) => {
          println!("{}", Notice::success("Resposta definitiva registrada!"));
          if let Some(text) = board.view(&id).await.and_then(|v| v.feedback) {
            println!();
            println!("{}", text);
          }
          Ok(())
        }
        Err(e) => fail(e.notice(), e.route()),
      }
    }
    Command::Listen => {
      let url = cfg.ws_endpoint();
      println!("{}", Notice::info(format!("Conectando a {} (Ctrl-C para sair)", url)));
      let socket = SocketHandle::mount(url, &cfg.socket, |msg| match msg {
        Inbound::Text(text) => println!("{}", text),
        Inbound::Binary(bytes) => println!("<{} bytes>", bytes.len()),
      });
      tokio::signal::ctrl_c().await?;
      socket.shutdown().await;
      Ok(())
    }
    Command::Admin(cmd) => {
      resume(&api, &store).await;
      admin(cmd, &api).await
    }
  }
}

async fn admin(cmd: AdminCommand, api: &ApiClient) -> CliResult {
  let result = match cmd {
    AdminCommand::Contents => api.admin_contents().await.map(|list| {
      for c in list {
        println!("{:<38} {:<28} {}", c.id, c.module, c.lesson);
      }
    }),
    AdminCommand::Cohorts => api.cohorts().await.map(|list| {
      for c in list {
        println!("{}", c);
      }
    }),
    AdminCommand::History => api.release_history().await.map(|list| {
      for r in list {
        println!(
          "{} {} · {} / {} · turmas: {} · {}",
          r.date.as_deref().unwrap_or("-"),
          r.time.as_deref().unwrap_or("-"),
          r.module,
          r.lesson,
          r.cohorts.join(", "),
          if r.released { "liberado" } else { "agendado" },
        );
      }
    }),
    AdminCommand::Release { content, module, lesson, cohorts, at } => {
      let body = ReleaseIn { content_id: content, module, lesson, cohorts, data_iso: at };
      api.release(&body).await.map(|_| {
        println!("{}", Notice::success("Conteúdo liberado!"));
      })
    }
    AdminCommand::Users => api.user_total().await.map(|total| {
      println!("Usuários cadastrados: {}", total);
    }),
  };
  match result {
    Ok(()) => Ok(()),
    Err(e) => fail(e.notice(), e.route()),
  }
}

/// Rebuild the live session from the remembered CPF (the token is never stored).
async fn resume(api: &ApiClient, store: &SessionStore) {
  if store.current().await.is_some() {
    return;
  }
  let Some(cpf) = store.stored_identity().await.cpf else {
    fail(Notice::error("Nenhuma sessão ativa. Faça login com seu CPF."), Some(Route::Login));
  };
  match api.login(&cpf).await {
    Ok(token) => store.init(Session::new(cpf, token.access_token)).await,
    Err(e) => {
      store.clear().await;
      fail(e.notice(), Some(Route::Login));
    }
  }
}

async fn load_board(api: ApiClient, store: &SessionStore) -> ChallengeBoard<ApiClient> {
  match ChallengeBoard::load(api, store).await {
    Ok(board) => board,
    Err(e) => fail(e.notice(), e.route()),
  }
}

fn next_step(route: Route) -> &'static str {
  match route {
    Route::Login => "pbl-client login <cpf>",
    Route::Courses => "pbl-client courses",
    Route::Onboarding => "pbl-client onboard --agree",
    Route::Challenges => "pbl-client challenges",
    Route::Profile => "pbl-client profile",
  }
}

fn done(notice: Option<Notice>, route: Option<Route>) -> CliResult {
  if let Some(n) = notice {
    println!("{}", n);
  }
  if let Some(r) = route {
    println!("Próximo passo: {}", next_step(r));
  }
  Ok(())
}

fn fail(notice: Notice, route: Option<Route>) -> ! {
  eprintln!("{}", notice);
  if let Some(r) = route {
    eprintln!("Próximo passo: {}", next_step(r));
  }
  std::process::exit(1)
}
