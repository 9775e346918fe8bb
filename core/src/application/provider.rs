// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Provider flow: register tools, listen for offers, execute accepted tasks
//! in the sandbox and report back.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::IsTerminal;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::application::prompt_yes_no;
use crate::domain::credential::AiTool;
use crate::domain::message::{P2pEnvelope, P2pPayload, ProviderRegistration, RelayMessage};
use crate::domain::peer::PeerId;
use crate::domain::settings::Settings;
use crate::domain::task::{Task, TaskId};
use crate::infrastructure::backend::BackendClient;
use crate::infrastructure::identity::IdentityAgent;
use crate::infrastructure::relay_client::RelaySession;
use crate::infrastructure::sandbox::{SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner};
use crate::infrastructure::tools::{CredentialError, ToolCredentials};

pub struct ListenOptions {
    pub tools: Vec<AiTool>,
    /// Accept every offer without prompting (implied without a TTY).
    pub auto_accept: bool,
    pub relay_url: Option<String>,
}

/// Collect credentials for each listed tool and register them with the
/// backend. Tools whose credentials are missing or expired are refused with
/// the exact remedial command; the rest are registered.
pub async fn register(tools: &[AiTool]) -> Result<()> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings.clone())?;
    let token = identity.get_token().await?;
    let credentials = ToolCredentials::open_default()?;

    let mut registered = Vec::new();
    for tool in tools {
        match credentials.authenticate(*tool).await {
            Ok(_) => {
                println!("{} {}", "Authenticated".green().bold(), tool);
                registered.push(*tool);
            }
            Err(e @ CredentialError::ReauthRequired { .. }) => {
                eprintln!("{} {}", "Skipped:".yellow().bold(), e);
            }
            Err(e) => return Err(e).with_context(|| format!("cannot authenticate {}", tool)),
        }
    }

    if registered.is_empty() {
        anyhow::bail!("no tools could be authenticated - nothing to register");
    }

    let backend = BackendClient::new(&settings.backend_url, &token.access);
    backend
        .register_provider_tools(&registered)
        .await
        .context("backend rejected the tool registration")?;
    println!(
        "{} {} tool(s) registered",
        "Done:".green().bold(),
        registered.len()
    );
    Ok(())
}

struct ActiveTask {
    task: Task,
    requester_id: Option<PeerId>,
    running: bool,
}

/// Open a relay session as a provider and serve offers until interrupted.
pub async fn listen(options: ListenOptions) -> Result<i32> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings.clone())?;
    let token = identity.get_token().await?;
    let claims = identity.claims().await?;
    let backend = BackendClient::new(&settings.backend_url, &token.access);
    let credentials = ToolCredentials::open_default()?;

    // Reject stale tools at startup rather than failing mid-task.
    let now = chrono::Utc::now();
    for tool in &options.tools {
        match credentials.freshness(*tool) {
            Some(expires_at) if expires_at > now => {}
            _ => {
                return Err(CredentialError::reauth(*tool))
                    .with_context(|| format!("{} cannot be offered", tool));
            }
        }
    }

    let workspace_ids: Vec<String> = backend
        .profile()
        .await
        .context("cannot resolve your workspaces")?
        .workspaces
        .iter()
        .map(|w| w.id.clone())
        .collect();
    if workspace_ids.is_empty() {
        anyhow::bail!("your profile has no workspaces - create one in the dashboard");
    }

    let runner = SandboxRunner::new(settings.debug_pause)?;
    let relay_url = options
        .relay_url
        .clone()
        .unwrap_or_else(|| settings.relay_url.clone());
    let mut session = RelaySession::connect(&relay_url, &token.access).await?;
    session
        .send(&RelayMessage::RegisterProvider {
            payload: ProviderRegistration {
                tools: options.tools.clone(),
                workspace_ids,
                user_id: claims.sub.clone(),
                token: token.access.clone(),
            },
        })
        .await?;

    println!(
        "{} offering {} - press Ctrl-C to stop",
        "Listening".green().bold(),
        options
            .tools
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let interactive = std::io::stdin().is_terminal() && !options.auto_accept;
    let (outcome_tx, mut outcome_rx) =
        mpsc::channel::<(TaskId, Result<SandboxOutcome, SandboxError>)>(1);
    let mut current: Option<ActiveTask> = None;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                if let Some(active) = &current {
                    warn!("interrupted with task {} active, killing sandbox", active.task.id);
                    runner.kill_task(active.task.id).await;
                }
                session.close().await;
                println!("\n{}", "Provider stopped.".yellow());
                return Ok(0);
            }

            Some((task_id, result)) = outcome_rx.recv() => {
                let Some(active) = current.as_mut() else { continue };
                if active.task.id != task_id { continue }
                active.running = false;

                let Some(requester_id) = active.requester_id else {
                    warn!("sandbox finished but the requester is unknown, dropping result");
                    current = None;
                    continue;
                };

                match result {
                    Ok(outcome) => {
                        info!(task = %task_id, "execution complete");
                        println!("{} task {}", "Completed".green().bold(), task_id);
                        session.send(&RelayMessage::P2pRelay {
                            from: session.peer_id,
                            to: requester_id,
                            payload: P2pEnvelope::now(P2pPayload::ExecutionComplete {
                                task_id,
                                commit_summary: outcome.commit_summary,
                            }),
                        }).await?;
                        // Stay bound to the task until the confirmation arrives.
                    }
                    Err(e) => {
                        eprintln!("{} {}", "Execution failed:".red().bold(), e);
                        session.send(&RelayMessage::P2pRelay {
                            from: session.peer_id,
                            to: requester_id,
                            payload: P2pEnvelope::now(P2pPayload::ExecutionFailed {
                                task_id,
                                error: e.to_string(),
                            }),
                        }).await?;
                        current = None;
                    }
                }
            }

            frame = session.next() => match frame? {
                RelayMessage::NewTask { task } => {
                    if current.is_some() {
                        // One task at a time; the relay should not offer, but
                        // decline defensively.
                        session.send(&RelayMessage::DeclineTask { task_id: task.id }).await?;
                        continue;
                    }

                    println!(
                        "\n{} {} task ({} credits): {}",
                        "Offer:".cyan().bold(),
                        task.tool,
                        task.credits,
                        task.description
                    );
                    let accept = if interactive {
                        prompt_yes_no("Accept this task? [Y/n] ").await
                    } else {
                        true
                    };

                    if accept {
                        session.send(&RelayMessage::AcceptTask { task_id: task.id }).await?;
                        current = Some(ActiveTask { task, requester_id: None, running: false });
                    } else {
                        session.send(&RelayMessage::DeclineTask { task_id: task.id }).await?;
                    }
                }

                RelayMessage::TaskAccepted { task_id, requester_id } => {
                    if let Some(active) = current.as_mut() {
                        if active.task.id == task_id {
                            active.requester_id = Some(requester_id);
                            info!(task = %task_id, requester = %requester_id, "task bound");
                        }
                    }
                }

                RelayMessage::P2pRelay { from, payload, .. } => match payload.payload {
                    P2pPayload::GitCredentials { git_url, git_token, tool, model, task_description } => {
                        let Some(active) = current.as_mut() else {
                            warn!("git credentials without an active task, ignoring");
                            continue;
                        };
                        if active.requester_id.is_none() {
                            active.requester_id = Some(from);
                        }
                        if active.running {
                            warn!("duplicate git credentials, ignoring");
                            continue;
                        }

                        let credential = match credentials.authenticate(tool).await {
                            Ok(credential) => credential,
                            Err(e) => {
                                eprintln!("{} {}", "Cannot execute:".red().bold(), e);
                                session.send(&RelayMessage::P2pRelay {
                                    from: session.peer_id,
                                    to: from,
                                    payload: P2pEnvelope::now(P2pPayload::ExecutionFailed {
                                        task_id: active.task.id,
                                        error: e.to_string(),
                                    }),
                                }).await?;
                                current = None;
                                continue;
                            }
                        };

                        let request = SandboxRequest {
                            task_id: active.task.id,
                            public_host: host_of(&git_url),
                            git_url,
                            git_token,
                            tool,
                            model,
                            task_description,
                            oauth_blob: credential.opaque_blob,
                        };
                        active.running = true;
                        println!("{} task {} in the sandbox", "Executing".cyan().bold(), active.task.id);

                        let runner = runner.clone();
                        let tx = outcome_tx.clone();
                        let task_id = active.task.id;
                        tokio::spawn(async move {
                            let result = runner.run(&request).await;
                            let _ = tx.send((task_id, result)).await;
                        });
                    }

                    P2pPayload::Confirmation { accepted, credits, task_id } => {
                        session.send(&RelayMessage::P2pRelay {
                            from: session.peer_id,
                            to: from,
                            payload: P2pEnvelope::now(P2pPayload::ConfirmationAck { task_id }),
                        }).await?;
                        println!(
                            "{} {} credits ({})",
                            "Earned".green().bold(),
                            credits,
                            if accepted { "patch accepted" } else { "patch declined" }
                        );
                        current = None;
                    }

                    other => { warn!("ignoring p2p payload: {:?}", other); }
                },

                RelayMessage::TaskCancelled { task_id, reason } => {
                    if let Some(active) = &current {
                        if active.task.id == task_id {
                            eprintln!(
                                "{} task {} ({})",
                                "Cancelled:".yellow().bold(),
                                task_id,
                                reason.unwrap_or_else(|| "no reason given".into())
                            );
                            runner.kill_task(task_id).await;
                            if let Err(e) = backend.cancel_task(&task_id.to_string()).await {
                                warn!("backend cancel not recorded: {}", e);
                            }
                            current = None;
                        }
                    }
                }

                RelayMessage::Error { message } => {
                    warn!("relay error: {}", message);
                }

                other => { warn!("ignoring frame: {:?}", other); }
            }
        }
    }
}

/// Hostname of the requester's public git URL, for the container's
/// host-gateway DNS mapping.
fn host_of(url: &str) -> String {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("http://calm-otter-7.tunnel.example.com:8080/abc.git"),
            "calm-otter-7.tunnel.example.com"
        );
        assert_eq!(
            host_of("http://calm-otter-7.tunnel.example.com/abc.git"),
            "calm-otter-7.tunnel.example.com"
        );
    }
}
