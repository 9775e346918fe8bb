// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Requester flow: publish → match → tunnel → credentials → await completion
//! → fetch diff → apply → confirm.
//!
//! The ephemeral git server stays up from the moment credentials are sent
//! until the final diff has been extracted. SIGINT at any point triggers a
//! best-effort backend cancel (3 s network budget), a `cancel_task` frame and
//! local teardown before exiting 130.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::domain::credential::AiTool;
use crate::domain::message::{
    P2pEnvelope, P2pPayload, PublishTask, RelayMessage, RequesterRegistration,
};
use crate::domain::peer::PeerId;
use crate::domain::settings::Settings;
use crate::domain::task::{TaskId, TaskStatus};
use crate::application::patcher::{self, PatchOutcome};
use crate::application::prompt_yes_no;
use crate::infrastructure::backend::{BackendClient, TaskRecord};
use crate::infrastructure::gitserver::EphemeralGitServer;
use crate::infrastructure::identity::IdentityAgent;
use crate::infrastructure::relay_client::RelaySession;
use crate::infrastructure::tunnel::{self, TunnelClient};
use crate::infrastructure::vault::Vault;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_NETWORK_BUDGET: Duration = Duration::from_secs(3);

pub struct PublishOptions {
    pub tool: AiTool,
    pub model: Option<String>,
    pub description: String,
    pub files: Vec<PathBuf>,
    pub workspace: Option<String>,
    pub credits: f64,
    pub estimated_duration: u64,
    /// `false` with `--no-auto-apply`; ignored (forced on) without a TTY.
    pub auto_apply: bool,
    pub relay_url: Option<String>,
}

/// Run the full requester flow. The returned code is the process exit code.
pub async fn publish(options: PublishOptions) -> Result<i32> {
    let settings = Settings::from_env();
    let identity = IdentityAgent::new(settings.clone())?;
    let token = identity.get_token().await?;
    let claims = identity.claims().await?;
    let backend = BackendClient::new(&settings.backend_url, &token.access);

    // One active task per requester; refuse before touching the relay.
    match backend.active_tasks().await {
        Ok(active) if active.has_active_tasks => {
            anyhow::bail!(
                "you already have an active task - wait for it to finish or cancel it \
                 before publishing another"
            );
        }
        Ok(_) => {}
        Err(e) => warn!("active-task probe failed (continuing): {}", e),
    }

    let workspace_id = match &options.workspace {
        Some(workspace) => workspace.clone(),
        None => backend
            .profile()
            .await
            .context("cannot resolve your workspace")?
            .default_workspace()
            .context("your profile has no workspace - create one in the dashboard")?,
    };

    let relay_url = options
        .relay_url
        .clone()
        .unwrap_or_else(|| settings.relay_url.clone());
    let mut session = RelaySession::connect(&relay_url, &token.access).await?;
    session
        .send(&RelayMessage::RegisterRequester {
            payload: RequesterRegistration {
                workspace_id: workspace_id.clone(),
                user_id: claims.sub.clone(),
            },
        })
        .await?;

    session
        .send(&RelayMessage::PublishTask {
            payload: PublishTask {
                tool: options.tool,
                model: options.model.clone(),
                task: options.description.clone(),
                description: options.description.clone(),
                estimated_duration: options.estimated_duration,
                credits: options.credits,
                workspace_id: workspace_id.clone(),
            },
        })
        .await?;

    // -- wait for task_published ------------------------------------------
    let task_id = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                return Ok(interrupt(&mut session, &backend, None, None).await);
            }
            frame = session.next() => match frame? {
                RelayMessage::TaskPublished { task_id } => break task_id,
                RelayMessage::Error { message } => anyhow::bail!("relay refused the task: {}", message),
                other => { warn!("ignoring frame while publishing: {:?}", other); }
            }
        }
    };
    println!("{} task {}", "Published".green().bold(), task_id);
    upsert_record(&backend, task_id, &options, TaskStatus::Pending, None, None).await;

    // -- wait for a match --------------------------------------------------
    let provider_id = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                return Ok(interrupt(&mut session, &backend, Some(task_id), None).await);
            }
            frame = session.next() => match frame? {
                RelayMessage::TaskMatched { task_id: matched, provider_id } if matched == task_id => {
                    break provider_id;
                }
                RelayMessage::NoProvidersAvailable { tool, .. } => {
                    eprintln!(
                        "{} no providers are online for {} in this workspace",
                        "Unmatched:".red().bold(),
                        tool
                    );
                    upsert_record(&backend, task_id, &options, TaskStatus::Failed, None, None).await;
                    return Ok(EXIT_FAILURE);
                }
                RelayMessage::TaskCancelled { reason, .. } => {
                    anyhow::bail!("task was cancelled: {}", reason.unwrap_or_default());
                }
                other => { warn!("ignoring frame while matching: {:?}", other); }
            }
        }
    };
    println!("{} provider {}", "Matched".green().bold(), provider_id);
    if let Err(e) = backend
        .bind_provider(&task_id.to_string(), &provider_id.to_string())
        .await
    {
        warn!("provider binding not recorded: {}", e);
    }

    // -- stand up the git server behind a tunnel ---------------------------
    let vault = Vault::open_default()?;
    let tunnel_config = tunnel::resolve_config(&settings, &backend, &vault).await?;
    let tunnel_client = TunnelClient::new(tunnel_config);

    let mut server = EphemeralGitServer::initialize(task_id, &options.files).await?;
    let git_config = match server.start(&tunnel_client).await {
        Ok(config) => config,
        Err(e) => {
            server.stop().await;
            let _ = session
                .send(&RelayMessage::CancelTask {
                    task_id,
                    reason: Some("tunnel setup failed".into()),
                })
                .await;
            return Err(e).context("could not expose the ephemeral git server");
        }
    };
    info!(url = %git_config.url, "git server exposed");

    session
        .send(&RelayMessage::P2pRelay {
            from: session.peer_id,
            to: provider_id,
            payload: P2pEnvelope::now(P2pPayload::GitCredentials {
                git_url: git_config.url.clone(),
                git_token: git_config.bearer.clone(),
                tool: options.tool,
                model: options.model.clone(),
                task_description: options.description.clone(),
            }),
        })
        .await?;
    println!("{} waiting for the provider to finish...", "Running".cyan().bold());

    // -- await execution result --------------------------------------------
    let summary = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                return Ok(interrupt(&mut session, &backend, Some(task_id), Some(server)).await);
            }
            frame = session.next() => match frame? {
                RelayMessage::P2pRelay { payload, .. } => match payload.payload {
                    P2pPayload::ExecutionComplete { task_id: done, commit_summary } if done == task_id => {
                        break commit_summary;
                    }
                    P2pPayload::ExecutionFailed { task_id: failed, error } if failed == task_id => {
                        eprintln!("{} {}", "Execution failed:".red().bold(), error);
                        server.stop().await;
                        upsert_record(&backend, task_id, &options, TaskStatus::Failed, None, None).await;
                        return Ok(EXIT_FAILURE);
                    }
                    other => { warn!("ignoring p2p payload: {:?}", other); }
                },
                RelayMessage::TaskCancelled { reason, .. } => {
                    server.stop().await;
                    anyhow::bail!("provider cancelled the task: {}", reason.unwrap_or_default());
                }
                other => { warn!("ignoring frame during execution: {:?}", other); }
            }
        }
    };

    // The server must survive until the diff is extracted.
    let changes = server.get_changes().await;
    let changes = match changes {
        Ok(changes) => changes,
        Err(e) => {
            server.stop().await;
            return Err(e).context("could not extract the result diff");
        }
    };

    let accepted = present_and_apply(task_id, &changes, summary.as_deref(), options.auto_apply).await?;

    // -- confirm, await ack, tear down -------------------------------------
    session
        .send(&RelayMessage::P2pRelay {
            from: session.peer_id,
            to: provider_id,
            payload: P2pEnvelope::now(P2pPayload::Confirmation {
                accepted,
                credits: options.credits,
                task_id,
            }),
        })
        .await?;

    match session.next_timeout(ACK_TIMEOUT).await {
        Ok(Some(RelayMessage::P2pRelay { payload, .. }))
            if matches!(payload.payload, P2pPayload::ConfirmationAck { .. }) =>
        {
            info!("provider acknowledged confirmation");
        }
        Ok(_) | Err(_) => warn!("no confirmation ack within {:?}, tearing down", ACK_TIMEOUT),
    }

    server.stop().await;
    upsert_record(
        &backend,
        task_id,
        &options,
        TaskStatus::Completed,
        Some(provider_id),
        summary,
    )
    .await;
    session.close().await;

    println!("{}", "Task completed.".green().bold());
    Ok(EXIT_OK)
}

/// Show the result and run the patch pipeline. Returns the `accepted` flag
/// for the confirmation payload: only an explicit user rejection clears it.
async fn present_and_apply(
    task_id: TaskId,
    changes: &crate::infrastructure::gitserver::RepoChanges,
    summary: Option<&str>,
    auto_apply_flag: bool,
) -> Result<bool> {
    let interactive = std::io::stdout().is_terminal();

    if !interactive {
        // Structured output contract for AI CLI callers.
        println!("[HOKIPOKI_RESULT]");
        if let Some(summary) = summary {
            println!("{}", summary);
        }
        if let Some(review) = &changes.ai_review {
            println!("{}", review);
        }
        println!("[/HOKIPOKI_RESULT]");
        if changes.has_code_changes() {
            println!("[HOKIPOKI_PATCH]");
            print!("{}", changes.code_diff);
            println!("[/HOKIPOKI_PATCH]");
        }
    } else {
        if let Some(summary) = summary {
            println!("\n{} {}", "Provider:".bold(), summary);
        }
        if let Some(review) = &changes.ai_review {
            println!("\n{}\n{}", "AI review".bold().underline(), review);
        }
    }

    if !changes.has_code_changes() {
        if interactive {
            println!("{}", "No code changes were produced.".yellow());
        }
        return Ok(true);
    }

    // `--no-auto-apply` keeps the patch on disk; at a TTY it asks instead,
    // and only an explicit "no" there counts as rejecting the work.
    let (apply_now, explicit_reject) = if auto_apply_flag {
        (true, false)
    } else if interactive {
        let yes = prompt_yes_no("Apply the patch to your working tree now? [Y/n] ").await;
        (yes, !yes)
    } else {
        (false, false)
    };

    let mut accepted = true;
    match patcher::apply(task_id, &changes.code_diff, apply_now).await? {
        PatchOutcome::Applied => {
            if interactive {
                println!("{}", "Patch applied.".green());
            }
        }
        PatchOutcome::Conflict(path) => {
            // The provider still gets paid on a conflict.
            eprintln!("{} {}", "Conflict:".yellow().bold(), patcher::manual_apply_hint(&path));
        }
        PatchOutcome::Declined(path) => {
            accepted = !explicit_reject;
            println!("Patch kept at {} (not applied).", path.display());
        }
    }

    Ok(accepted)
}

/// SIGINT path: cancel upstream with a hard network budget, tear down, 130.
async fn interrupt(
    session: &mut RelaySession,
    backend: &BackendClient,
    task_id: Option<TaskId>,
    server: Option<EphemeralGitServer>,
) -> i32 {
    eprintln!("\n{} cancelling...", "Interrupted,".yellow().bold());
    if let Some(task_id) = task_id {
        backend
            .cancel_task_with_timeout(&task_id.to_string(), CANCEL_NETWORK_BUDGET)
            .await;
        let _ = session
            .send(&RelayMessage::CancelTask {
                task_id,
                reason: Some("requester interrupted".into()),
            })
            .await;
    }
    if let Some(server) = server {
        server.stop().await;
    }
    EXIT_INTERRUPTED
}

/// Dashboard logging is advisory: log and continue on failure.
async fn upsert_record(
    backend: &BackendClient,
    task_id: TaskId,
    options: &PublishOptions,
    status: TaskStatus,
    provider_id: Option<PeerId>,
    summary: Option<String>,
) {
    let record = TaskRecord {
        id: task_id.to_string(),
        tool: options.tool,
        model: options.model.clone(),
        description: options.description.clone(),
        status,
        credits: options.credits,
        created_at: chrono::Utc::now(),
        completed_at: status.is_terminal().then(chrono::Utc::now),
        provider_id: provider_id.map(|p| p.to_string()),
        summary,
    };
    if let Err(e) = backend.upsert_task(&record).await {
        warn!("task record not persisted: {}", e);
    }
}
