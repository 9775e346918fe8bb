// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # HokiPoki Relay
//!
//! The central process every peer connects to: it authenticates peers,
//! owns the authoritative task table, matches requesters to providers and
//! relays opaque P2P payloads between matched peers over one WebSocket per
//! connection.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

mod auth;
mod matching;
mod session;
mod state;

use auth::OidcUserinfoValidator;
use state::RelayState;

/// HokiPoki matchmaking relay
#[derive(Parser)]
#[command(name = "hokipoki-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bind address
    #[arg(long, env = "HOKIPOKI_RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, env = "HOKIPOKI_RELAY_PORT", default_value = "9400")]
    port: u16,

    /// OIDC issuer used to validate peer tokens
    #[arg(
        long,
        env = "HOKIPOKI_KEYCLOAK_ISSUER",
        default_value = hokipoki_core::domain::settings::DEFAULT_ISSUER
    )]
    issuer: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HOKIPOKI_RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let validator = Arc::new(OidcUserinfoValidator::new(cli.issuer.clone()));
    let state = Arc::new(RelayState::new());

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(session::ws_handler))
        .with_state(session::AppState {
            relay: state.clone(),
            validator,
        });

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server failed")?;

    info!("relay shutting down");
    Ok(())
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<session::AppState>,
) -> axum::Json<serde_json::Value> {
    let stats = state.relay.stats();
    axum::Json(serde_json::json!({
        "status": "healthy",
        "peers": stats.peers,
        "providers": stats.providers,
        "active_tasks": stats.active_tasks,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
