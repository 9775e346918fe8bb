// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tool-Credential Adapter: per-AI-CLI credential acquisition.
//!
//! Each tool has its own source of truth (an interactive setup subprocess for
//! claude, native credential files for codex and gemini). Credentials are
//! transported as a double-encoded blob: the exact JSON document the native
//! tool expects, serialized once more as a JSON string so it survives the
//! further serialization into the sandbox environment.

mod claude;
mod codex;
mod gemini;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::domain::credential::{AiTool, ToolCredential};
use crate::infrastructure::paths;
use crate::infrastructure::vault::{Vault, VaultError};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{tool} is not authenticated - run `{remedy}` and try again")]
    ReauthRequired { tool: AiTool, remedy: String },
    #[error("credential source for {tool} is malformed: {detail}")]
    Malformed { tool: AiTool, detail: String },
    #[error("credential i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl CredentialError {
    pub fn reauth(tool: AiTool) -> Self {
        CredentialError::ReauthRequired {
            tool,
            remedy: tool.login_command().to_string(),
        }
    }
}

/// Serialize a native credential document once as a JSON string.
pub fn encode_opaque_blob(file_content: &str) -> String {
    serde_json::to_string(file_content).expect("strings always encode")
}

/// Invert [`encode_opaque_blob`]: exactly two JSON decodes back to the
/// structured document the native tool expects.
pub fn decode_opaque_blob(blob: &str) -> Result<serde_json::Value, serde_json::Error> {
    let document: String = serde_json::from_str(blob)?;
    serde_json::from_str(&document)
}

/// Decode the `exp` claim (seconds since epoch) of a JWT without verifying
/// the signature.
pub(crate) fn decode_jwt_exp(jwt: &str) -> Option<i64> {
    #[derive(serde::Deserialize)]
    struct ExpClaim {
        exp: i64,
    }

    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<ExpClaim>(
        jwt,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .ok()
    .map(|data| data.claims.exp)
}

pub struct ToolCredentials {
    home: PathBuf,
    vault: Vault,
}

impl ToolCredentials {
    pub fn open_default() -> Result<Self, CredentialError> {
        Ok(Self {
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            vault: Vault::open_default()?,
        })
    }

    /// Adapter rooted at an arbitrary home directory (tests).
    pub fn at(home: impl Into<PathBuf>, vault: Vault) -> Self {
        Self {
            home: home.into(),
            vault,
        }
    }

    /// Obtain a fresh credential for `tool`, consulting the sealed cache
    /// first. Failures are recoverable by running the tool's native login.
    pub async fn authenticate(&self, tool: AiTool) -> Result<ToolCredential, CredentialError> {
        if let Some(cached) = self.cached(tool)? {
            if !cached.is_expired(Utc::now()) {
                debug!(tool = %tool, "using cached tool credential");
                return Ok(cached);
            }
        }

        let credential = match tool {
            AiTool::Claude => claude::acquire().await?,
            AiTool::Codex => codex::acquire(&self.home)?,
            AiTool::Gemini => gemini::acquire(&self.home)?,
        };
        self.remember(&credential)?;
        Ok(credential)
    }

    /// Tools whose credential source is present and unexpired, without any
    /// interactive acquisition.
    pub fn list_authenticated(&self) -> Vec<AiTool> {
        let now = Utc::now();
        AiTool::ALL
            .into_iter()
            .filter(|tool| match self.freshness(*tool) {
                Some(expires_at) => expires_at > now,
                None => false,
            })
            .collect()
    }

    /// Expiry of a tool's credential source, `None` when absent or unreadable.
    pub fn freshness(&self, tool: AiTool) -> Option<DateTime<Utc>> {
        match tool {
            // The claude token lives only in our sealed cache.
            AiTool::Claude => self.cached(tool).ok().flatten().map(|c| c.expires_at),
            AiTool::Codex => codex::freshness(&self.home),
            AiTool::Gemini => gemini::freshness(&self.home),
        }
    }

    /// Drop a cached credential (used when a tool reports unauthenticated).
    pub fn forget(&self, tool: AiTool) -> Result<(), CredentialError> {
        let mut all = self.load_cache()?;
        all.retain(|c| c.tool != tool);
        self.vault.store_json(paths::ENVELOPE_TOOLS, &all)?;
        Ok(())
    }

    fn cached(&self, tool: AiTool) -> Result<Option<ToolCredential>, CredentialError> {
        Ok(self.load_cache()?.into_iter().find(|c| c.tool == tool))
    }

    fn remember(&self, credential: &ToolCredential) -> Result<(), CredentialError> {
        let mut all = self.load_cache()?;
        all.retain(|c| c.tool != credential.tool);
        all.push(credential.clone());
        self.vault.store_json(paths::ENVELOPE_TOOLS, &all)?;
        Ok(())
    }

    fn load_cache(&self) -> Result<Vec<ToolCredential>, CredentialError> {
        Ok(self
            .vault
            .load_json::<Vec<ToolCredential>>(paths::ENVELOPE_TOOLS)?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_blob_survives_one_more_serialization() {
        let native = r#"{"tokens":{"access_token":"abc"},"last_refresh":"now"}"#;
        let blob = encode_opaque_blob(native);

        // Transport: the blob rides inside another JSON document.
        let wire = serde_json::json!({ "OAUTH_TOKEN": blob }).to_string();
        let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
        let transported = parsed["OAUTH_TOKEN"].as_str().unwrap();

        let document = decode_opaque_blob(transported).unwrap();
        assert_eq!(document["tokens"]["access_token"], "abc");
    }

    #[test]
    fn jwt_exp_claim_decodes() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1700000000}"#);
        let jwt = format!("{}.{}.sig", header, payload);
        assert_eq!(decode_jwt_exp(&jwt), Some(1_700_000_000));
        assert_eq!(decode_jwt_exp("not-a-jwt"), None);
    }
}
