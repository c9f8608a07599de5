mod api;
mod auth_utils;
mod ban_store;
mod config;
mod db_utils;
mod error;
mod events;
mod guard;
mod log_config;
mod login_guard;
mod response;
mod vote_guard;

use crate::api::AppState;
use crate::auth_utils::AuthUtils;
use crate::config::{read_or_create_secret, ServerConfig};
use crate::db_utils::DbUtils;
use crate::log_config::init_logging;
use anyhow::Context;
use chrono::Utc;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

fn print_usage() {
    eprintln!("Usage: arcvoted [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --init-config        Interactively create the config file and exit");
    eprintln!("  --help               Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  CONFIG_PATH          Path to config file (default: config/arcvoted.toml)");
    eprintln!("  LOG_FILE_PATH        Path to log file, '-' for stderr (default: logs/arcvoted.log)");
    eprintln!("  ADMIN_PASSWORD       Admin console password (required)");
    eprintln!("  JWT_SECRET           Token signing secret (default: read from JWT_SECRET_PATH)");
    eprintln!("  JWT_SECRET_PATH      File holding the signing secret (default: secrets/jwt_secret)");
    eprintln!("  CORS_ORIGINS         Comma-separated allowed origins (default: any)");
    eprintln!("  PORT                 Listen port (default: 33000)");
    eprintln!("  DATABASE_PATH        Path to SQLite database (default: data/votes.db)");
    eprintln!("  RUST_LOG             Log level filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut init_config = false;
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--init-config" => init_config = true,
            other => {
                print_usage();
                return Err(anyhow::anyhow!("Unknown option: {}", other));
            }
        }
    }

    let config_path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ServerConfig::default_path());

    if init_config {
        let config = ServerConfig::create_interactive()?;
        config.save(&config_path)?;
        println!("Configuration saved to {}", config_path.display());
        return Ok(());
    }

    let mut config = ServerConfig::load_or_default(&config_path)?;
    config.apply_env()?;
    config.validate()?;

    run_server(config).await
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let log_file = std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/arcvoted.log".to_string());
    init_logging(&log_file)?;

    log::info!("Starting vote server on port {}", config.port);
    if config.cors_origins.is_empty() {
        log::warn!("No CORS origins configured, allowing any origin");
    }

    let jwt_secret = match std::env::var("JWT_SECRET") {
        Ok(secret) if !secret.trim().is_empty() => SecretString::new(secret.trim().to_string()),
        _ => read_or_create_secret(&config.jwt_secret_path)?,
    };
    let auth = AuthUtils::new(config.admin_secret()?, jwt_secret);

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = DbUtils::new(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;

    let state = AppState::new(db, &config, auth);
    let app = api::router(state.clone(), &config.cors_origins)?;

    let cleanup = tokio::spawn(run_cleanup(
        state,
        Duration::from_secs(config.cleanup_interval_secs.max(1)),
    ));

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    log::info!("Listening on http://{}", address);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cleanup.abort();
    log::info!("Vote server stopped.");
    Ok(())
}

/// Periodically drop idle guard state and expired bans.
async fn run_cleanup(state: AppState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let now = Utc::now();
        state.vote_guard.cleanup(now);
        state.login_guard.cleanup(now);
        log::debug!(
            "Guard state: {} vote clients, {} login clients",
            state.vote_guard.len(),
            state.login_guard.len()
        );
        match state.db.purge_expired_bans(now).await {
            Ok(0) => {}
            Ok(n) => log::info!("Purged {} expired bans", n),
            Err(e) => log::error!("Failed to purge expired bans: {:#}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                log::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
