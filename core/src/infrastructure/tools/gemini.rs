// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Gemini credentials from the native `~/.gemini/oauth_creds.json` file.

use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;

use crate::domain::credential::{AiTool, ToolCredential};
use crate::infrastructure::tools::{encode_opaque_blob, CredentialError};

const CREDS_FILE: &str = ".gemini/oauth_creds.json";

pub fn acquire(home: &Path) -> Result<ToolCredential, CredentialError> {
    let path = home.join(CREDS_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| CredentialError::reauth(AiTool::Gemini))?;

    let expires_at = expiry_of(&raw).ok_or_else(|| CredentialError::Malformed {
        tool: AiTool::Gemini,
        detail: format!("{} has no expiry_date field", path.display()),
    })?;

    if expires_at <= Utc::now() {
        return Err(CredentialError::reauth(AiTool::Gemini));
    }

    Ok(ToolCredential {
        tool: AiTool::Gemini,
        opaque_blob: encode_opaque_blob(&raw),
        expires_at,
    })
}

pub fn freshness(home: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(home.join(CREDS_FILE)).ok()?;
    expiry_of(&raw)
}

/// `expiry_date` is a millisecond unix timestamp.
fn expiry_of(raw: &str) -> Option<DateTime<Utc>> {
    let document: serde_json::Value = serde_json::from_str(raw).ok()?;
    let millis = document["expiry_date"].as_i64()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_creds(home: &Path, expiry_millis: i64) {
        let dir = home.join(".gemini");
        std::fs::create_dir_all(&dir).unwrap();
        let content = serde_json::json!({
            "access_token": "ya29.x",
            "refresh_token": "1//r",
            "expiry_date": expiry_millis,
        })
        .to_string();
        std::fs::write(dir.join("oauth_creds.json"), content).unwrap();
    }

    #[test]
    fn expired_creds_require_reauth() {
        let home = tempdir().unwrap();
        write_creds(home.path(), 1_000);
        assert!(matches!(
            acquire(home.path()),
            Err(CredentialError::ReauthRequired { .. })
        ));
    }

    #[test]
    fn fresh_creds_round_trip() {
        let home = tempdir().unwrap();
        let expiry = (Utc::now() + chrono::Duration::hours(1)).timestamp_millis();
        write_creds(home.path(), expiry);

        let credential = acquire(home.path()).unwrap();
        assert_eq!(credential.tool, AiTool::Gemini);
        assert_eq!(credential.expires_at.timestamp_millis(), expiry);
        assert!(freshness(home.path()).is_some());
    }
}
