// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # HokiPoki Sandbox Executor
//!
//! Runs as PID-namespaced root inside the sandbox container. Everything the
//! task touches lives in a LUKS-encrypted loopback image on tmpfs; the key
//! exists only in this process and the device-mapper layer, and both the key
//! and the image are destroyed before exit. Any failed step aborts into an
//! emergency wipe so no plaintext survives.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

mod runner;
mod workspace;

/// Task parameters handed in by the host supervisor.
pub struct ExecContext {
    pub task_id: String,
    pub git_url: String,
    pub git_token: String,
    pub tool: hokipoki_core::domain::credential::AiTool,
    pub model: Option<String>,
    pub task_description: String,
    pub oauth_blob: String,
    pub home: PathBuf,
}

impl ExecContext {
    fn from_env() -> Result<Self> {
        fn required(key: &str) -> Result<String> {
            std::env::var(key).with_context(|| format!("missing environment variable {}", key))
        }

        Ok(Self {
            task_id: required("TASK_ID")?,
            git_url: required("GIT_URL")?,
            git_token: required("GIT_TOKEN")?,
            tool: required("AI_TOOL")?
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,
            model: std::env::var("AI_MODEL").ok(),
            task_description: required("TASK_DESCRIPTION")?,
            oauth_blob: required("OAUTH_TOKEN")?,
            home: PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/root".into())),
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let context = match ExecContext::from_env() {
        Ok(context) => context,
        Err(e) => {
            error!("invalid environment: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(task = %context.task_id, tool = %context.tool, "sandbox executor starting");

    let exit = match run(&context).await {
        Ok(()) => 0,
        Err(e) => {
            error!("execution failed: {:#}", e);
            workspace::emergency_wipe(&context.home);
            1
        }
    };

    std::process::exit(exit);
}

async fn run(context: &ExecContext) -> Result<()> {
    runner::mark_safe_directories(context).await?;

    let mut encrypted = workspace::EncryptedWorkspace::setup().await?;
    let result = runner::execute_task(context, encrypted.mount_point()).await;

    // Teardown runs on success and failure alike; an error after a clean run
    // still zeroes the key and destroys the image.
    encrypted.teardown().await;
    runner::shred_git_config(context).await;

    result
}
