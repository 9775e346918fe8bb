// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-level configuration, resolved from environment variables with
//! production defaults.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ISSUER: &str = "https://auth.hoki-poki.ai/realms/hokipoki";
pub const DEFAULT_CLIENT_ID: &str = "hokipoki-cli";
pub const DEFAULT_BACKEND_URL: &str = "https://api.hoki-poki.ai";
pub const DEFAULT_RELAY_URL: &str = "wss://relay.hoki-poki.ai/ws";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub keycloak_issuer: String,
    pub client_id: String,
    pub backend_url: String,
    pub relay_url: String,
    /// Overrides for the backend-issued tunnel config. When all of addr,
    /// port and auth token are present the backend fetch is skipped.
    pub frp_server_addr: Option<String>,
    pub frp_server_port: Option<u16>,
    pub frp_auth_token: Option<String>,
    pub frp_http_port: Option<u16>,
    pub frp_tunnel_domain: Option<String>,
    /// Proceed with login when the email-verification probe is unreachable.
    pub verify_email_fail_open: bool,
    /// Hold the sandbox container before removal for inspection.
    pub debug_pause: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            keycloak_issuer: env_or("HOKIPOKI_KEYCLOAK_ISSUER", DEFAULT_ISSUER),
            client_id: env_or("HOKIPOKI_CLIENT_ID", DEFAULT_CLIENT_ID),
            backend_url: env_or("BACKEND_URL", DEFAULT_BACKEND_URL),
            relay_url: env_or("HOKIPOKI_RELAY_URL", DEFAULT_RELAY_URL),
            frp_server_addr: std::env::var("FRP_SERVER_ADDR").ok(),
            frp_server_port: parse_env("FRP_SERVER_PORT"),
            frp_auth_token: std::env::var("FRP_AUTH_TOKEN").ok(),
            frp_http_port: parse_env("FRP_HTTP_PORT"),
            frp_tunnel_domain: std::env::var("FRP_TUNNEL_DOMAIN").ok(),
            verify_email_fail_open: env_or("HOKIPOKI_VERIFY_EMAIL_FAIL_OPEN", "true") != "false",
            debug_pause: std::env::var("DEBUG_PAUSE").is_ok(),
        }
    }

    /// Tunnel settings from the environment alone, when complete.
    pub fn env_tunnel_config(&self) -> Option<crate::domain::credential::TunnelConfig> {
        Some(crate::domain::credential::TunnelConfig {
            server_addr: self.frp_server_addr.clone()?,
            server_port: self.frp_server_port?,
            token: self.frp_auth_token.clone()?,
            public_http_port: self.frp_http_port.unwrap_or(80),
            subdomain_host: self
                .frp_tunnel_domain
                .clone()
                .unwrap_or_else(|| "tunnel.hoki-poki.ai".to_string()),
            fetched_at: chrono::Utc::now(),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
