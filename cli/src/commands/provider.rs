// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `hokipoki provider` - register tools and serve tasks.

use anyhow::Result;
use clap::Subcommand;

use hokipoki_core::application::provider::{self, ListenOptions};
use hokipoki_core::domain::credential::AiTool;

use crate::commands::task::AiToolArg;

#[derive(Subcommand)]
pub enum ProviderCommand {
    /// Collect credentials for the given tools and register them
    Register {
        /// Tools to offer (claude, codex, gemini)
        #[arg(short, long, value_delimiter = ',', required = true)]
        tools: Vec<AiToolArg>,
    },

    /// Listen for task offers and execute them in the sandbox
    Listen {
        /// Tools to offer (claude, codex, gemini)
        #[arg(short, long, value_delimiter = ',', required = true)]
        tools: Vec<AiToolArg>,

        /// Accept every offer without prompting
        #[arg(long)]
        auto_accept: bool,

        /// Relay endpoint override
        #[arg(long, env = "HOKIPOKI_RELAY_URL")]
        relay_url: Option<String>,
    },
}

pub async fn handle_command(command: ProviderCommand) -> Result<i32> {
    match command {
        ProviderCommand::Register { tools } => {
            provider::register(&unwrap_tools(tools)).await?;
            Ok(0)
        }
        ProviderCommand::Listen {
            tools,
            auto_accept,
            relay_url,
        } => {
            provider::listen(ListenOptions {
                tools: unwrap_tools(tools),
                auto_accept,
                relay_url,
            })
            .await
        }
    }
}

fn unwrap_tools(tools: Vec<AiToolArg>) -> Vec<AiTool> {
    tools.into_iter().map(|t| t.0).collect()
}
