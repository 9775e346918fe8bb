// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task execution inside the encrypted workspace: clone, credential
//! injection, the AI CLI invocation and the result commit.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use hokipoki_core::domain::credential::AiTool;
use hokipoki_core::infrastructure::sandbox::{COMMIT_SENTINEL_CLOSE, COMMIT_SENTINEL_OPEN};
use hokipoki_core::infrastructure::tools::decode_opaque_blob;

use crate::ExecContext;

const AI_TIMEOUT_SECS: u64 = 20 * 60;
const OUTPUT_CAP: usize = 10 * 1024 * 1024;
const SUMMARY_MAX_CHARS: usize = 200;
const OUTPUT_FILE: &str = "AI_OUTPUT.md";
const CRED_HELPER_FILE: &str = ".git-credential-helper.sh";

/// Trust the mount point (and everything else: the clone is root-owned but
/// git refuses dubious ownership by default).
pub async fn mark_safe_directories(context: &ExecContext) -> Result<()> {
    git_global(context, &["config", "--global", "safe.directory", "/workspace/code"]).await?;
    git_global(context, &["config", "--global", "--add", "safe.directory", "*"]).await?;
    git_global(context, &["config", "--global", "user.name", "HokiPoki Sandbox"]).await?;
    git_global(context, &["config", "--global", "user.email", "sandbox@hoki-poki.ai"]).await?;
    Ok(())
}

/// Clone, inject, run the agent, commit and push. The caller owns workspace
/// teardown.
pub async fn execute_task(context: &ExecContext, mount: &Path) -> Result<()> {
    configure_credential_helper(context).await?;

    let repo = mount.join("repo");
    git(context, mount, &["clone", &context.git_url, repo_str(&repo)?]).await
        .context("clone through the tunnel failed")?;
    info!("repository cloned");

    let extra_env = inject_credentials(context).context("credential injection failed")?;

    let task_text = enhance_task(&context.task_description, &repo);
    let (program, args) = invocation(context.tool, context.model.as_deref(), &task_text);
    info!(tool = %context.tool, "invoking AI CLI");

    let output = run_ai_cli(&program, &args, &repo, &extra_env).await?;
    std::fs::write(repo.join(OUTPUT_FILE), &output).context("cannot write AI output")?;

    git(context, &repo, &["add", "-A"]).await?;
    let status = git(context, &repo, &["status", "--porcelain"]).await?;
    if status.trim().is_empty() {
        info!("working tree is clean, skipping commit and push");
        return Ok(());
    }

    let summary = summarize_output(&output)
        .unwrap_or_else(|| "task executed with no readable output".to_string());
    let message = format!("HokiPoki {}: {}", context.tool, summary);
    git(context, &repo, &["commit", "-m", &message]).await?;

    // The host supervisor scrapes the commit message off our stdout.
    println!("{}{}{}", COMMIT_SENTINEL_OPEN, message, COMMIT_SENTINEL_CLOSE);

    let branch = git(context, &repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    git(context, &repo, &["push", "origin", branch.trim()]).await
        .context("push through the tunnel failed")?;
    info!("result pushed");
    Ok(())
}

/// Helper script that answers every credential prompt with the one-time
/// bearer. Lives outside the encrypted mount so it must be shredded.
async fn configure_credential_helper(context: &ExecContext) -> Result<()> {
    let path = context.home.join(CRED_HELPER_FILE);
    let script = format!(
        "#!/bin/sh\necho \"username={}\"\necho \"password=x-oauth-basic\"\n",
        context.git_token
    );
    std::fs::write(&path, script)?;
    make_executable(&path)?;

    git_global(
        context,
        &["config", "--global", "credential.helper", repo_str(&path)?],
    )
    .await?;
    Ok(())
}

/// Destroy the git config and credential helper. Runs on every exit path.
pub async fn shred_git_config(context: &ExecContext) {
    for path in [
        context.home.join(CRED_HELPER_FILE),
        context.home.join(".gitconfig"),
    ] {
        if path.exists() {
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mut noise = vec![0u8; (metadata.len() as usize).min(64 * 1024)];
                rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut noise);
                let _ = std::fs::write(&path, &noise);
            }
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Materialize the native credential files the AI CLI expects. Returns extra
/// environment for the CLI invocation.
fn inject_credentials(context: &ExecContext) -> Result<Vec<(String, String)>> {
    match context.tool {
        AiTool::Claude => {
            // The blob is the raw OAuth token, encoded once.
            let token: String = serde_json::from_str(&context.oauth_blob)
                .context("claude token blob is not a JSON string")?;

            let config_dir = context.home.join(".claude-config");
            std::fs::create_dir_all(&config_dir)?;
            std::fs::write(
                config_dir.join(".claude.json"),
                serde_json::to_string_pretty(&serde_json::json!({
                    "acceptEditsModeAccepted": true,
                }))?,
            )?;

            Ok(vec![("CLAUDE_CODE_OAUTH_TOKEN".to_string(), token)])
        }
        AiTool::Codex => {
            let document = decode_opaque_blob(&context.oauth_blob)
                .context("codex credential blob does not double-decode")?;

            let auth_dir = context.home.join(".codex");
            std::fs::create_dir_all(&auth_dir)?;
            std::fs::write(
                auth_dir.join("auth.json"),
                serde_json::to_string_pretty(&serde_json::json!({
                    "OPENAI_API_KEY": null,
                    "tokens": document["tokens"],
                    "last_refresh": Utc::now().to_rfc3339(),
                }))?,
            )?;
            std::fs::write(
                auth_dir.join("config.toml"),
                "approval_policy = \"never\"\nsandbox_mode = \"danger-full-access\"\n",
            )?;

            Ok(vec![])
        }
        AiTool::Gemini => {
            let document = decode_opaque_blob(&context.oauth_blob)
                .context("gemini credential blob does not double-decode")?;

            let config_dir = context.home.join(".gemini");
            std::fs::create_dir_all(&config_dir)?;
            std::fs::write(
                config_dir.join("oauth_creds.json"),
                serde_json::to_string_pretty(&document)?,
            )?;
            std::fs::write(
                config_dir.join("settings.json"),
                serde_json::to_string_pretty(&serde_json::json!({
                    "selectedAuthType": "oauth-personal",
                }))?,
            )?;

            Ok(vec![])
        }
    }
}

/// Per-tool command line, fully non-interactive.
fn invocation(tool: AiTool, model: Option<&str>, task: &str) -> (String, Vec<String>) {
    match tool {
        AiTool::Claude => {
            let mut args = vec!["--permission-mode".into(), "acceptEdits".into()];
            if let Some(model) = model {
                args.push("--model".into());
                args.push(model.into());
            }
            args.push(task.into());
            ("claude".into(), args)
        }
        AiTool::Codex => {
            let mut args = vec![
                "exec".into(),
                "--full-auto".into(),
                "--sandbox".into(),
                "danger-full-access".into(),
            ];
            if let Some(model) = model {
                args.push("--model".into());
                args.push(model.into());
            }
            args.push(task.into());
            ("codex".into(), args)
        }
        AiTool::Gemini => {
            let mut args = Vec::new();
            if let Some(model) = model {
                args.push("-m".into());
                args.push(model.into());
            }
            args.push("-p".into());
            args.push(task.into());
            args.push("--yolo".into());
            ("gemini".into(), args)
        }
    }
}

/// Give the agent a map of the tree so it does not burn its budget on
/// discovery.
fn enhance_task(description: &str, repo: &Path) -> String {
    let mut listing = Vec::new();
    for entry in walkdir::WalkDir::new(repo)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(repo) {
                listing.push(relative.display().to_string());
            }
        }
    }
    listing.sort();

    if listing.is_empty() {
        description.to_string()
    } else {
        format!(
            "{}\n\nFiles in this repository:\n{}",
            description,
            listing.join("\n")
        )
    }
}

/// Run the AI CLI with stdin closed, draining stdout and stderr
/// concurrently, under the 20-minute wall clock.
async fn run_ai_cli(
    program: &str,
    args: &[String],
    cwd: &Path,
    extra_env: &[(String, String)],
) -> Result<String> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in extra_env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("cannot run {} - is it installed in the image?", program))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(drain_capped(stdout));
    let err_task = tokio::spawn(drain_capped(stderr));

    let status = match tokio::time::timeout(
        std::time::Duration::from_secs(AI_TIMEOUT_SECS),
        child.wait(),
    )
    .await
    {
        Ok(status) => status?,
        Err(_) => {
            warn!("AI CLI hit the 20-minute wall clock, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
            anyhow::bail!("AI CLI timed out after {} seconds", AI_TIMEOUT_SECS);
        }
    };

    let mut output = out_task.await.unwrap_or_default();
    let errors = err_task.await.unwrap_or_default();
    if !errors.is_empty() {
        output.push_str("\n\n--- stderr ---\n");
        output.push_str(&errors);
    }
    if output.len() > OUTPUT_CAP {
        output.truncate(OUTPUT_CAP);
    }

    if !status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            program,
            status,
            last_lines(&output, 5)
        );
    }
    Ok(output)
}

async fn drain_capped(mut reader: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buffer.len() < OUTPUT_CAP {
                    buffer.extend_from_slice(&chunk[..n]);
                }
                // Keep draining past the cap so the child never blocks.
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// First meaningful output line, capped at 200 chars, with anything
/// token-shaped or URL-shaped redacted.
pub fn summarize_output(output: &str) -> Option<String> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("---"))?;

    let token_pattern = regex::Regex::new(r"[A-Za-z0-9_-]{20,}").expect("static pattern");
    let url_pattern = regex::Regex::new(r"https?://\S+").expect("static pattern");

    let redacted = url_pattern.replace_all(line, "[URL]");
    let redacted = token_pattern.replace_all(&redacted, "[REDACTED]");

    let mut summary: String = redacted.chars().take(SUMMARY_MAX_CHARS).collect();
    if summary.is_empty() {
        return None;
    }
    if redacted.chars().count() > SUMMARY_MAX_CHARS {
        summary.push('…');
    }
    Some(summary)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

async fn git_global(context: &ExecContext, args: &[&str]) -> Result<String> {
    git(context, &context.home, args).await
}

async fn git(context: &ExecContext, cwd: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("HOME", &context.home)
        .output()
        .await
        .context("cannot run git")?;

    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn repo_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("non-utf8 path: {}", path.display()))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_redacts_tokens_and_urls() {
        let output = "Pushed fix using token sk-ant-REDACTED to https://example.com/repo.git\nmore";
        let summary = summarize_output(output).unwrap();
        assert!(summary.contains("[REDACTED]"));
        assert!(summary.contains("[URL]"));
        assert!(!summary.contains("sk-ant"));
        assert!(!summary.contains("example.com"));
    }

    #[test]
    fn summary_takes_first_meaningful_line() {
        let output = "\n   \nFixed the typo in a.txt\nSecond line";
        assert_eq!(
            summarize_output(output).as_deref(),
            Some("Fixed the typo in a.txt")
        );
        assert!(summarize_output("\n \n").is_none());
    }

    #[test]
    fn summary_is_capped_at_200_chars() {
        let long = "word ".repeat(100);
        let summary = summarize_output(&long).unwrap();
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS + 1);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn invocation_forms_match_each_tool() {
        let (program, args) = invocation(AiTool::Claude, Some("opus"), "fix it");
        assert_eq!(program, "claude");
        assert_eq!(
            args,
            vec!["--permission-mode", "acceptEdits", "--model", "opus", "fix it"]
        );

        let (program, args) = invocation(AiTool::Codex, None, "fix it");
        assert_eq!(program, "codex");
        assert_eq!(
            args,
            vec!["exec", "--full-auto", "--sandbox", "danger-full-access", "fix it"]
        );

        let (program, args) = invocation(AiTool::Gemini, Some("flash"), "fix it");
        assert_eq!(program, "gemini");
        assert_eq!(args, vec!["-m", "flash", "-p", "fix it", "--yolo"]);
    }

    #[test]
    fn enhance_task_lists_files_without_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join(".git/config"), "hidden").unwrap();

        let enhanced = enhance_task("fix it", dir.path());
        assert!(enhanced.starts_with("fix it"));
        assert!(enhanced.contains("src/main.rs"));
        assert!(!enhanced.contains(".git/config"));
    }
}
