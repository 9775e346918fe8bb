// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Claude Code credentials via the interactive `claude setup-token` flow.

use chrono::{Duration, Utc};
use regex::Regex;
use std::process::Stdio;
use tracing::info;

use crate::domain::credential::{AiTool, ToolCredential};
use crate::infrastructure::tools::{encode_opaque_blob, CredentialError};

/// Long-lived OAuth tokens issued by `claude setup-token`.
const TOKEN_PATTERN: &str = r"sk-ant-oat01-[A-Za-z0-9_-]+";
const TOKEN_TTL_DAYS: i64 = 30;

/// Run `claude setup-token` with the user's terminal attached and scrape the
/// resulting token from its output.
pub async fn acquire() -> Result<ToolCredential, CredentialError> {
    info!("launching `claude setup-token` (interactive)");

    let child = tokio::process::Command::new("claude")
        .arg("setup-token")
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|_| CredentialError::reauth(AiTool::Claude))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|_| CredentialError::reauth(AiTool::Claude))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    let pattern = Regex::new(TOKEN_PATTERN).expect("static pattern compiles");
    let token = pattern
        .find(&combined)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| CredentialError::reauth(AiTool::Claude))?;

    Ok(ToolCredential {
        tool: AiTool::Claude,
        opaque_blob: encode_opaque_blob(&token),
        expires_at: Utc::now() + Duration::days(TOKEN_TTL_DAYS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pattern_matches_setup_output() {
        let pattern = Regex::new(TOKEN_PATTERN).unwrap();
        let output = "Your token:\n  sk-ant-REDACTED\nKeep it secret.";
        assert_eq!(
            pattern.find(output).unwrap().as_str(),
            "sk-ant-REDACTED"
        );
        assert!(pattern.find("no token here").is_none());
    }
}
