// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential and configuration records that pass through the Token Vault.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The third-party AI command-line agents a provider can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiTool {
    Claude,
    Codex,
    Gemini,
}

impl AiTool {
    pub const ALL: [AiTool; 3] = [AiTool::Claude, AiTool::Codex, AiTool::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            AiTool::Claude => "claude",
            AiTool::Codex => "codex",
            AiTool::Gemini => "gemini",
        }
    }

    /// The native command a user runs to (re-)authenticate the tool.
    pub fn login_command(&self) -> &'static str {
        match self {
            AiTool::Claude => "claude setup-token",
            AiTool::Codex => "codex login",
            AiTool::Gemini => "gemini (complete the OAuth flow once)",
        }
    }
}

impl std::fmt::Display for AiTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AiTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(AiTool::Claude),
            "codex" => Ok(AiTool::Codex),
            "gemini" => Ok(AiTool::Gemini),
            other => Err(format!(
                "unknown tool '{}' (expected claude, codex or gemini)",
                other
            )),
        }
    }
}

/// OIDC tokens for the HokiPoki identity provider.
///
/// At most one live copy per user home; sealed into `keycloak_token.enc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityToken {
    pub access: String,
    pub refresh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl IdentityToken {
    /// Access tokens are refreshed once less than five minutes remain.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now < Duration::minutes(5)
    }
}

/// A native AI CLI credential, transported verbatim.
///
/// `opaque_blob` is the exact JSON document the native tool expects, encoded
/// once as a JSON string so it survives one further JSON serialization on the
/// way into the sandbox environment. Never log the blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCredential {
    pub tool: AiTool,
    pub opaque_blob: String,
    pub expires_at: DateTime<Utc>,
}

impl ToolCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Reverse-tunnel gateway coordinates, issued by the backend and cached for
/// 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub token: String,
    pub server_addr: String,
    pub server_port: u16,
    pub subdomain_host: String,
    pub public_http_port: u16,
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl TunnelConfig {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Duration::hours(24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_token_refresh_window() {
        let now = Utc::now();
        let fresh = IdentityToken {
            access: "a".into(),
            refresh: "r".into(),
            id_token: None,
            expires_at: now + Duration::minutes(30),
        };
        let stale = IdentityToken {
            expires_at: now + Duration::minutes(4),
            ..fresh.clone()
        };

        assert!(!fresh.needs_refresh(now));
        assert!(stale.needs_refresh(now));
    }

    #[test]
    fn tool_parses_case_insensitively() {
        assert_eq!("Claude".parse::<AiTool>().unwrap(), AiTool::Claude);
        assert!("cursor".parse::<AiTool>().is_err());
    }

    #[test]
    fn tunnel_config_staleness() {
        let now = Utc::now();
        let config = TunnelConfig {
            token: "t".into(),
            server_addr: "frp.example.com".into(),
            server_port: 7000,
            subdomain_host: "tunnel.example.com".into(),
            public_http_port: 8080,
            fetched_at: now - Duration::hours(25),
        };
        assert!(config.is_stale(now));
    }
}
