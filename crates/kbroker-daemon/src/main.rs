//! kbroker daemon
//!
//! Supervises interpreter worker processes and serves the HTTP/WebSocket
//! API clients use to create sessions and attach to them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use kbroker_core::config::load_config;
use kbroker_daemon::process::CommandLauncher;
use kbroker_daemon::server::{AppState, build_router};
use kbroker_daemon::session::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "kbroker-daemon")]
#[command(version, about = "kbroker daemon - interpreter worker broker")]
struct Args {
    /// Configuration file layered over the global one
    #[arg(long, env = "KBROKER_CONFIG")]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// Root directory for per-user working directories
    #[arg(long)]
    working_root: Option<PathBuf>,

    /// Interpreter used when a request names none
    #[arg(long)]
    default_interpreter: Option<String>,

    /// Seconds to wait for graceful worker shutdown before SIGKILL.
    #[arg(long)]
    terminate_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if args.log_json {
        config.server.log_json = true;
    }
    if let Some(root) = args.working_root {
        config.sessions.working_root = root;
    }
    if let Some(name) = args.default_interpreter {
        config.default_interpreter = Some(name);
    }
    if let Some(secs) = args.terminate_timeout {
        config.sessions.terminate_timeout_secs = secs;
    }

    let log_filter =
        kbroker_core::tracing_init::daemon_filter("kbroker_daemon", &config.server.log_level);
    if !kbroker_core::tracing_init::init_tracing(&log_filter, config.server.log_json) {
        tracing::warn!("Tracing subscriber already installed; keeping it");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        interpreters = config.interpreters.len(),
        default_interpreter = ?config.default_interpreter,
        "Starting kbroker-daemon"
    );
    if config.interpreters.is_empty() {
        tracing::warn!("No interpreters configured; session creation will fail");
    }

    let launcher = CommandLauncher::new(Duration::from_secs(
        config.sessions.terminate_timeout_secs,
    ));
    let addr = config.server.addr;
    let manager = SessionManager::new(config, Arc::new(launcher));
    let app = build_router(AppState {
        manager: manager.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager.clone()))
        .await?;

    manager.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM, then stop open pipe connections.
async fn shutdown_signal(manager: SessionManager) {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    // Open WebSocket bridges hold the server open; end them first.
    manager.shutdown_token().cancel();
}
