#![forbid(unsafe_code)]

//! Command-line driver for the `agent-relay` execution gateway.
//!
//! Streams every update to stdout as one JSON object per line, followed by
//! the final result. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::backend::{CallbackFuture, UpdateCallback};
use agent_relay::config::GlobalConfig;
use agent_relay::models::execution::ExecutionResult;
use agent_relay::orchestrator::build_gateway;
use agent_relay::orchestrator::expiry::spawn_expiry_task;
use agent_relay::persistence::db;
use agent_relay::{AppError, ExecutionGateway, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Drive an AI coding backend through managed sessions", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a prompt, resuming `--session` when given.
    Run {
        /// Requesting user id.
        #[arg(long)]
        user: String,
        /// Working directory for the backend.
        #[arg(long)]
        dir: PathBuf,
        /// Existing session id.
        #[arg(long)]
        session: Option<String>,
        /// Prompt text.
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// Continue the most recent confirmed session in a directory.
    Continue {
        /// Requesting user id.
        #[arg(long)]
        user: String,
        /// Working directory for the backend.
        #[arg(long)]
        dir: PathBuf,
        /// Optional new prompt.
        prompt: Vec<String>,
    },
    /// List a user's sessions.
    Sessions {
        /// User id.
        #[arg(long)]
        user: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!(approved_directory = %config.approved_directory.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let database = match &config.database_path {
        Some(path) => {
            let pool = db::connect(path).await?;
            info!(path = %path.display(), "database connected");
            Some(Arc::new(pool))
        }
        None => None,
    };

    let gateway = Arc::new(build_gateway(&config, database));

    // ── Start expiry sweep ──────────────────────────────
    let ct = CancellationToken::new();
    let expiry_handle = spawn_expiry_task(
        Arc::clone(gateway.registry()),
        Duration::from_secs(config.sessions.sweep_interval_seconds),
        config.sessions.timeout_hours,
        ct.clone(),
    );

    // ── Dispatch, honouring shutdown signals ────────────
    let work = dispatch(args.command, &gateway);
    tokio::pin!(work);
    let outcome = tokio::select! {
        res = &mut work => res,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            gateway.shutdown();
            work.await
        }
    };

    ct.cancel();
    if let Err(err) = expiry_handle.await {
        warn!(%err, "expiry task did not shut down cleanly");
    }

    if let Err(err) = &outcome {
        error!(%err, "command failed");
        println!("{}", json!({ "type": "error", "message": err.user_message() }));
    }
    outcome
}

async fn dispatch(command: Command, gateway: &ExecutionGateway) -> Result<()> {
    match command {
        Command::Run {
            user,
            dir,
            session,
            prompt,
        } => {
            let result = gateway
                .execute(
                    &prompt.join(" "),
                    &dir,
                    &user,
                    session.as_deref(),
                    Some(print_updates()),
                )
                .await?;
            print_result(&result)
        }
        Command::Continue { user, dir, prompt } => {
            let prompt = prompt.join(" ");
            let prompt = (!prompt.is_empty()).then_some(prompt.as_str());
            match gateway
                .continue_session(&user, &dir, prompt, Some(print_updates()))
                .await?
            {
                Some(result) => print_result(&result),
                None => {
                    println!(
                        "{}",
                        json!({ "type": "error", "message": "No session to continue in this directory." })
                    );
                    Ok(())
                }
            }
        }
        Command::Sessions { user } => {
            for session in gateway.registry().user_sessions(&user).await? {
                println!("{}", serde_json::to_string(&session)?);
            }
            Ok(())
        }
    }
}

fn print_updates() -> UpdateCallback {
    Arc::new(|update| -> CallbackFuture {
        Box::pin(async move {
            println!("{}", serde_json::to_string(&update)?);
            Ok(())
        })
    })
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let mut value = serde_json::to_value(result)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("type".into(), json!("result"));
    }
    println!("{value}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
