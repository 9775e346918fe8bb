// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Codex credentials from the native `~/.codex/auth.json` file.

use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;

use crate::domain::credential::{AiTool, ToolCredential};
use crate::infrastructure::tools::{decode_jwt_exp, encode_opaque_blob, CredentialError};

const AUTH_FILE: &str = ".codex/auth.json";

/// Read the file `codex login` maintains and reject it when the embedded
/// access token's `exp` claim has passed.
pub fn acquire(home: &Path) -> Result<ToolCredential, CredentialError> {
    let path = home.join(AUTH_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| CredentialError::reauth(AiTool::Codex))?;

    let expires_at = expiry_of(&raw).ok_or_else(|| CredentialError::Malformed {
        tool: AiTool::Codex,
        detail: format!("{} has no readable access token", path.display()),
    })?;

    if expires_at <= Utc::now() {
        return Err(CredentialError::reauth(AiTool::Codex));
    }

    Ok(ToolCredential {
        tool: AiTool::Codex,
        opaque_blob: encode_opaque_blob(&raw),
        expires_at,
    })
}

pub fn freshness(home: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(home.join(AUTH_FILE)).ok()?;
    expiry_of(&raw)
}

fn expiry_of(raw: &str) -> Option<DateTime<Utc>> {
    let document: serde_json::Value = serde_json::from_str(raw).ok()?;
    let jwt = document["tokens"]["access_token"]
        .as_str()
        .or_else(|| document["tokens"]["id_token"].as_str())?;
    let exp = decode_jwt_exp(jwt)?;
    Utc.timestamp_opt(exp, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use tempfile::tempdir;

    fn auth_json(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp).as_bytes());
        let jwt = format!("{}.{}.sig", header, payload);
        serde_json::json!({
            "OPENAI_API_KEY": null,
            "tokens": { "access_token": jwt, "refresh_token": "r" },
            "last_refresh": "2026-01-01T00:00:00Z"
        })
        .to_string()
    }

    fn write_auth(home: &Path, content: &str) {
        let dir = home.join(".codex");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("auth.json"), content).unwrap();
    }

    #[test]
    fn expired_token_requires_reauth() {
        let home = tempdir().unwrap();
        write_auth(home.path(), &auth_json(1_000_000));

        match acquire(home.path()) {
            Err(CredentialError::ReauthRequired { tool, remedy }) => {
                assert_eq!(tool, AiTool::Codex);
                assert!(remedy.contains("codex login"));
            }
            other => panic!("expected ReauthRequired, got {:?}", other),
        }
    }

    #[test]
    fn fresh_token_is_transported_verbatim() {
        let home = tempdir().unwrap();
        let exp = (Utc::now() + chrono::Duration::hours(2)).timestamp();
        let content = auth_json(exp);
        write_auth(home.path(), &content);

        let credential = acquire(home.path()).unwrap();
        assert_eq!(credential.tool, AiTool::Codex);
        assert_eq!(credential.expires_at.timestamp(), exp);

        // The blob decodes back to the exact file content.
        let decoded: String = serde_json::from_str(&credential.opaque_blob).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn missing_file_requires_reauth() {
        let home = tempdir().unwrap();
        assert!(matches!(
            acquire(home.path()),
            Err(CredentialError::ReauthRequired { .. })
        ));
        assert!(freshness(home.path()).is_none());
    }
}
