// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identity commands: login, logout, whoami, status.

use anyhow::{Context, Result};
use colored::Colorize;

use hokipoki_core::domain::settings::Settings;
use hokipoki_core::infrastructure::backend::BackendClient;
use hokipoki_core::infrastructure::identity::IdentityAgent;
use hokipoki_core::infrastructure::tools::ToolCredentials;

pub async fn login() -> Result<()> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings)?;
    let token = identity.login().await?;

    println!("{}", "Logged in.".green().bold());
    if let Some(claims) = hokipoki_core::infrastructure::identity::decode_claims(&token.access) {
        if let Some(email) = claims.email {
            println!("Signed in as {}", email.bold());
        }
    }
    Ok(())
}

pub async fn logout() -> Result<()> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings)?;
    identity.logout().await?;
    println!("{}", "Logged out, local secrets cleared.".green());
    Ok(())
}

pub async fn whoami() -> Result<()> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings.clone())?;
    let token = identity.get_token().await?;
    let backend = BackendClient::new(&settings.backend_url, &token.access);

    let profile = backend.profile().await.context("cannot fetch profile")?;
    println!("{} {}", "Email:".bold(), profile.email);
    println!("{} {}", "User id:".bold(), profile.id);
    if profile.workspaces.is_empty() {
        println!("{}", "No workspaces.".yellow());
    } else {
        println!("{}", "Workspaces:".bold());
        for workspace in &profile.workspaces {
            let marker = if workspace.is_personal.unwrap_or(false) {
                " (personal)"
            } else {
                ""
            };
            println!("  {} - {}{}", workspace.id, workspace.name, marker);
        }
    }
    Ok(())
}

pub async fn status() -> Result<()> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings.clone())?;
    let token = identity.get_token().await?;
    let backend = BackendClient::new(&settings.backend_url, &token.access);

    match backend.active_tasks().await {
        Ok(active) if active.has_active_tasks => {
            println!(
                "{} {} active task(s)",
                "Tasks:".bold(),
                active.active_tasks.len().max(1)
            );
            for task in &active.active_tasks {
                let id = task["id"].as_str().unwrap_or("?");
                let status = task["status"].as_str().unwrap_or("?");
                let description = task["description"].as_str().unwrap_or("");
                println!("  {} [{}] {}", id, status.cyan(), description);
            }
        }
        Ok(_) => println!("{} none", "Tasks:".bold()),
        Err(e) => println!("{} unavailable ({})", "Tasks:".bold(), e),
    }

    let credentials = ToolCredentials::open_default()?;
    let authenticated = credentials.list_authenticated();
    if authenticated.is_empty() {
        println!("{} none", "Local tool credentials:".bold());
    } else {
        println!(
            "{} {}",
            "Local tool credentials:".bold(),
            authenticated
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    match backend.provider_tools().await {
        Ok(tools) if !tools.is_empty() => println!(
            "{} {}",
            "Registered provider tools:".bold(),
            tools
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Ok(_) => println!("{} none", "Registered provider tools:".bold()),
        Err(e) => println!("{} unavailable ({})", "Registered provider tools:".bold(), e),
    }
    Ok(())
}
