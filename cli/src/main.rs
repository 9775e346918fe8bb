// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # HokiPoki CLI
//!
//! The `hokipoki` binary is both sides of the marketplace:
//!
//! - **Requesters** run `hokipoki publish` to execute a coding task on a
//!   provider's machine and receive the result as a patch.
//! - **Providers** run `hokipoki provider register` once and then
//!   `hokipoki provider listen` to serve tasks inside the encrypted sandbox.
//!
//! `login`/`logout` manage the marketplace identity; `whoami` and `status`
//! inspect it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{provider::ProviderCommand, task::PublishArgs};

/// HokiPoki - peer-to-peer marketplace for AI coding tasks
#[derive(Parser)]
#[command(name = "hokipoki")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HOKIPOKI_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the marketplace via the browser
    Login,

    /// End the session and clear local secrets
    Logout,

    /// Show the authenticated profile and workspaces
    Whoami,

    /// Show active tasks and authenticated provider tools
    Status,

    /// Publish a coding task and apply the resulting patch
    Publish(PublishArgs),

    /// Provider operations
    #[command(name = "provider")]
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Login => commands::auth::login().await.map(|_| 0),
        Commands::Logout => commands::auth::logout().await.map(|_| 0),
        Commands::Whoami => commands::auth::whoami().await.map(|_| 0),
        Commands::Status => commands::auth::status().await.map(|_| 0),
        Commands::Publish(args) => commands::task::publish(args).await,
        Commands::Provider { command } => commands::provider::handle_command(command).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
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
