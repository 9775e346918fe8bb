// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `hokipoki publish` - the requester side.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use hokipoki_core::application::requester::{self, PublishOptions};
use hokipoki_core::domain::credential::AiTool;

const DEFAULT_CREDITS: f64 = 2.5;

#[derive(Args)]
pub struct PublishArgs {
    /// The coding task to execute
    #[arg(value_name = "TASK")]
    pub task: String,

    /// AI tool to run (claude, codex, gemini)
    #[arg(short, long, default_value = "claude")]
    pub tool: AiToolArg,

    /// Model override passed to the tool
    #[arg(short, long)]
    pub model: Option<String>,

    /// Files to upload with the task (paths relative to the current directory)
    #[arg(short, long = "file", value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Workspace to publish into (defaults to your profile workspace)
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Credits offered for the task
    #[arg(long, default_value_t = DEFAULT_CREDITS)]
    pub credits: f64,

    /// Estimated duration in seconds (matching hint)
    #[arg(long, default_value = "1200")]
    pub estimated_duration: u64,

    /// Keep the patch on disk instead of applying it
    #[arg(long)]
    pub no_auto_apply: bool,

    /// Relay endpoint override
    #[arg(long, env = "HOKIPOKI_RELAY_URL")]
    pub relay_url: Option<String>,
}

// clap needs a FromStr wrapper that reports parse errors itself.
#[derive(Clone, Copy)]
pub struct AiToolArg(pub AiTool);

impl std::str::FromStr for AiToolArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(AiToolArg)
    }
}

pub async fn publish(args: PublishArgs) -> Result<i32> {
    requester::publish(PublishOptions {
        tool: args.tool.0,
        model: args.model,
        description: args.task,
        files: args.files,
        workspace: args.workspace,
        credits: args.credits,
        estimated_duration: args.estimated_duration,
        auto_apply: !args.no_auto_apply,
        relay_url: args.relay_url,
    })
    .await
}
