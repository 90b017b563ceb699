#![forbid(unsafe_code)]

//! The `tabletalk` conversational data-analysis server binary.
//!
//! Bootstraps configuration, the session registry, the event broadcaster,
//! and the HTTP transport, then runs until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use tabletalk::agent::process::ProcessRuntime;
use tabletalk::broadcast::{spawn_broadcast_timers, EventBroadcaster};
use tabletalk::config::GlobalConfig;
use tabletalk::http::{self, AppState};
use tabletalk::session::{spawn_sweeper, MemoryMonitor, SessionManager};
use tabletalk::turn::TurnRunner;
use tabletalk::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tabletalk", about = "Conversational data-analysis server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("tabletalk server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let mut config = GlobalConfig::from_toml_str(&config_text)?;

    // Apply CLI overrides. The workspace override is canonicalized the
    // same way validation canonicalizes the configured root.
    if let Some(workspace) = args.workspace {
        std::fs::create_dir_all(&workspace)
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.workspace_root = workspace
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }

    let config = Arc::new(config);
    info!(
        workspace_root = %config.workspace_root.display(),
        http_port = config.http_port,
        "configuration loaded"
    );

    // ── Build core services ─────────────────────────────
    let memory = Arc::new(MemoryMonitor::new());
    let runtime = Arc::new(ProcessRuntime::new(
        config.engine_command.clone(),
        config.engine_args.clone(),
        config.workspace_root.clone(),
    ));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&config),
        runtime,
        memory,
    ));
    let broadcaster = Arc::new(EventBroadcaster::new(
        &config.broadcast,
        tokio::runtime::Handle::current(),
    ));
    let turns = Arc::new(TurnRunner::new(
        Arc::clone(&manager),
        Arc::clone(&broadcaster),
        &config.turn,
    ));

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let sweeper_handle = spawn_sweeper(
        Arc::clone(&manager),
        config.lifecycle.cleanup_interval(),
        ct.clone(),
    );
    let timers_handle = spawn_broadcast_timers(Arc::clone(&broadcaster), ct.clone());
    info!("background tasks started");

    // ── Start HTTP transport ────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        manager: Arc::clone(&manager),
        broadcaster: Arc::clone(&broadcaster),
        turns: Arc::clone(&turns),
    });

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(http_state, http_ct).await {
            error!(%err, "http transport failed");
        }
    });

    info!("tabletalk server ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Graceful shutdown ───────────────────────────────
    // Abort turns first so no engine handle is returned to the registry
    // mid-teardown; tell streaming clients next; tear sessions down last.
    turns.shutdown();
    broadcaster.shutdown().await;
    manager.shutdown().await;

    let _ = tokio::join!(http_handle, sweeper_handle, timers_handle);
    info!("tabletalk shut down");

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
    let subscriber = fmt().with_env_filter(env_filter);

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
