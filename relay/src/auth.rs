// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Peer token validation against the identity provider.
//!
//! The relay never mints identity; it probes the issuer's userinfo endpoint
//! with the presented token. The trait seam keeps the relay testable without
//! a live provider.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthRejected {
    #[error("token rejected by the identity provider")]
    Invalid,
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthRejected>;
}

pub struct OidcUserinfoValidator {
    issuer: String,
    http: reqwest::Client,
}

impl OidcUserinfoValidator {
    pub fn new(issuer: String) -> Self {
        Self {
            issuer,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Userinfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

#[async_trait]
impl TokenValidator for OidcUserinfoValidator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthRejected> {
        let url = format!(
            "{}/protocol/openid-connect/userinfo",
            self.issuer.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthRejected::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            debug!("userinfo probe returned HTTP {}", response.status());
            return Err(AuthRejected::Invalid);
        }

        let info: Userinfo = response
            .json()
            .await
            .map_err(|_| AuthRejected::Invalid)?;
        Ok(AuthenticatedUser {
            user_id: info.sub,
            email: info.email,
        })
    }
}
