// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identity Agent: OIDC authorization-code flow with PKCE.
//!
//! Login binds a loopback HTTP listener on a fixed port, launches the platform
//! browser and waits for the provider to redirect back with the authorization
//! code. Tokens are sealed into the Token Vault and refreshed silently while a
//! refresh token remains usable.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::domain::credential::IdentityToken;
use crate::domain::settings::Settings;
use crate::infrastructure::paths;
use crate::infrastructure::vault::{Vault, VaultError};

/// Fixed loopback port the OIDC client is registered with.
pub const CALLBACK_PORT: u16 = 8976;
const CALLBACK_PATH: &str = "/callback";
const LOGIN_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated - run `hokipoki login` first")]
    Reauthenticate,
    #[error("email address is not verified - check your inbox, then run `hokipoki login` again")]
    EmailUnverified,
    #[error("identity provider error: {0}")]
    Oidc(String),
    #[error("network error talking to the identity provider: {0}")]
    Network(String),
    #[error("timed out waiting for the browser login to complete")]
    CallbackTimeout,
    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    end_session_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    id_token: Option<String>,
    expires_in: i64,
}

/// Claims we read out of the access token. Signature verification is the
/// relay's concern; locally we only need identity fields.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
}

pub struct IdentityAgent {
    settings: Settings,
    vault: Vault,
    http: reqwest::Client,
}

impl IdentityAgent {
    pub fn new(settings: Settings) -> Result<Self, AuthError> {
        Ok(Self {
            settings,
            vault: Vault::open_default()?,
            http: reqwest::Client::new(),
        })
    }

    /// Run the full browser login. Returns the fresh token after the
    /// email-verification gate passes.
    pub async fn login(&self) -> Result<IdentityToken, AuthError> {
        let discovery = self.discover().await?;

        let verifier = random_urlsafe(32);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = random_urlsafe(16);
        let redirect_uri = format!("http://127.0.0.1:{}{}", CALLBACK_PORT, CALLBACK_PATH);

        let authorize_url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope=openid%20email%20profile&state={}&code_challenge={}&code_challenge_method=S256",
            discovery.authorization_endpoint,
            urlencode(&self.settings.client_id),
            urlencode(&redirect_uri),
            state,
            challenge,
        );

        let code = self.wait_for_callback(&authorize_url, &state).await?;
        debug!("authorization code received, exchanging");

        let token = self
            .exchange(
                &discovery.token_endpoint,
                &[
                    ("grant_type", "authorization_code"),
                    ("client_id", &self.settings.client_id),
                    ("code", &code),
                    ("redirect_uri", &redirect_uri),
                    ("code_verifier", &verifier),
                ],
            )
            .await?;

        if let Some(email) = decode_claims(&token.access).and_then(|c| c.email) {
            self.check_email_verified(&email).await?;
        }

        self.vault.store_json(paths::ENVELOPE_IDENTITY, &token)?;
        info!("login complete, identity token sealed");
        Ok(token)
    }

    /// Return a valid access token, refreshing when less than five minutes
    /// remain. `Reauthenticate` when there is no token or the refresh fails.
    pub async fn get_token(&self) -> Result<IdentityToken, AuthError> {
        let Some(token) = self
            .vault
            .load_json::<IdentityToken>(paths::ENVELOPE_IDENTITY)?
        else {
            return Err(AuthError::Reauthenticate);
        };

        if !token.needs_refresh(Utc::now()) {
            return Ok(token);
        }

        debug!("access token near expiry, refreshing");
        let discovery = self.discover().await?;
        let refreshed = self
            .exchange(
                &discovery.token_endpoint,
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", &self.settings.client_id),
                    ("refresh_token", &token.refresh),
                ],
            )
            .await
            .map_err(|e| {
                warn!("token refresh failed: {}", e);
                AuthError::Reauthenticate
            })?;

        self.vault.store_json(paths::ENVELOPE_IDENTITY, &refreshed)?;
        Ok(refreshed)
    }

    /// Identity claims of the currently stored token.
    pub async fn claims(&self) -> Result<TokenClaims, AuthError> {
        let token = self.get_token().await?;
        decode_claims(&token.access)
            .ok_or_else(|| AuthError::Oidc("access token has no readable claims".into()))
    }

    /// Best-effort end-session, then destroy local secrets.
    pub async fn logout(&self) -> Result<(), AuthError> {
        if let Ok(Some(token)) = self
            .vault
            .load_json::<IdentityToken>(paths::ENVELOPE_IDENTITY)
        {
            if let Some(id_token) = token.id_token {
                if let Ok(discovery) = self.discover().await {
                    if let Some(end_session) = discovery.end_session_endpoint {
                        let result = self
                            .http
                            .post(&end_session)
                            .form(&[
                                ("client_id", self.settings.client_id.as_str()),
                                ("id_token_hint", id_token.as_str()),
                                ("refresh_token", token.refresh.as_str()),
                            ])
                            .send()
                            .await;
                        if let Err(e) = result {
                            warn!("end-session request failed (continuing): {}", e);
                        }
                    }
                }
            }
        }

        self.vault.delete(paths::ENVELOPE_IDENTITY)?;
        self.vault.delete(paths::ENVELOPE_TUNNEL)?;
        info!("local identity state cleared");
        Ok(())
    }

    async fn discover(&self) -> Result<DiscoveryDocument, AuthError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.settings.keycloak_issuer.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Oidc(format!(
                "discovery returned HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::Oidc(format!("invalid discovery document: {}", e)))
    }

    async fn exchange(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<IdentityToken, AuthError> {
        let response = self
            .http
            .post(token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Oidc(format!(
                "token endpoint returned HTTP {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Oidc(format!("invalid token response: {}", e)))?;

        Ok(IdentityToken {
            access: token.access_token,
            refresh: token.refresh_token,
            id_token: token.id_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    /// Backend probe for the email-verification gate. Network failures are
    /// treated as "assume verified" when fail-open is configured.
    async fn check_email_verified(&self, email: &str) -> Result<(), AuthError> {
        let url = format!(
            "{}/api/auth/check-verified?email={}",
            self.settings.backend_url,
            urlencode(email)
        );

        #[derive(Deserialize)]
        struct Verified {
            verified: bool,
        }

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Verified>().await {
                    Ok(v) if !v.verified => {
                        self.vault.delete(paths::ENVELOPE_IDENTITY)?;
                        Err(AuthError::EmailUnverified)
                    }
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("unreadable verification response, assuming verified: {}", e);
                        Ok(())
                    }
                }
            }
            Ok(response) => {
                warn!(
                    "verification probe returned HTTP {}, assuming verified",
                    response.status()
                );
                Ok(())
            }
            Err(e) if self.settings.verify_email_fail_open => {
                warn!("verification probe unreachable, assuming verified: {}", e);
                Ok(())
            }
            Err(e) => Err(AuthError::Network(e.to_string())),
        }
    }

    /// Serve the loopback callback until the provider redirects back with a
    /// code for our `state`, then tear the listener down.
    async fn wait_for_callback(
        &self,
        authorize_url: &str,
        expected_state: &str,
    ) -> Result<String, AuthError> {
        use axum::extract::{Query, State};
        use axum::response::Html;
        use axum::routing::get;
        use axum::Router;

        type Slot = Arc<Mutex<Option<oneshot::Sender<Result<String, String>>>>>;

        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));
        let expected = expected_state.to_string();

        let app = Router::new()
            .route(
                CALLBACK_PATH,
                get(
                    move |State(slot): State<Slot>, Query(params): Query<HashMap<String, String>>| {
                        let expected = expected.clone();
                        async move {
                            let outcome = if params.get("state") != Some(&expected) {
                                Err("state mismatch".to_string())
                            } else if let Some(error) = params.get("error") {
                                Err(error.clone())
                            } else if let Some(code) = params.get("code") {
                                Ok(code.clone())
                            } else {
                                Err("missing authorization code".to_string())
                            };

                            let page = match &outcome {
                                Ok(_) => Html(SUCCESS_PAGE.to_string()),
                                Err(reason) => {
                                    Html(ERROR_PAGE.replace("{reason}", reason))
                                }
                            };
                            if let Some(tx) = slot.lock().await.take() {
                                let _ = tx.send(outcome);
                            }
                            page
                        }
                    },
                ),
            )
            .with_state(slot);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", CALLBACK_PORT))
            .await
            .map_err(|e| {
                AuthError::Oidc(format!(
                    "cannot bind loopback port {}: {} (is another login running?)",
                    CALLBACK_PORT, e
                ))
            })?;

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        open_browser(authorize_url);
        println!("Waiting for browser login... (open {} manually if nothing happened)", authorize_url);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(LOGIN_TIMEOUT_SECS),
            rx,
        )
        .await;
        server.abort();

        match outcome {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(reason))) => Err(AuthError::Oidc(reason)),
            Ok(Err(_)) => Err(AuthError::Oidc("callback listener dropped".into())),
            Err(_) => Err(AuthError::CallbackTimeout),
        }
    }
}

/// Decode JWT claims without signature verification.
pub fn decode_claims(jwt: &str) -> Option<TokenClaims> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<TokenClaims>(
        jwt,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .ok()
    .map(|data| data.claims)
}

fn random_urlsafe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let spawn = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "windows")]
    let spawn = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn();
    #[cfg(all(unix, not(target_os = "macos")))]
    let spawn = std::process::Command::new("xdg-open").arg(url).spawn();

    if let Err(e) = spawn {
        warn!("could not launch browser: {}", e);
    }
}

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>HokiPoki</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
<h1>Login complete</h1>
<p>You can close this tab and return to the terminal.</p>
</body></html>"#;

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>HokiPoki</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
<h1>Login failed</h1>
<p>{reason}</p>
<p>Return to the terminal and try again.</p>
</body></html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_urlsafe_sha256() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        // RFC 7636 appendix B test vector.
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn verifier_entropy_is_32_bytes() {
        let verifier = random_urlsafe(32);
        assert_eq!(URL_SAFE_NO_PAD.decode(&verifier).unwrap().len(), 32);
    }

    #[test]
    fn claims_decode_ignores_signature() {
        // header {"alg":"RS256"} / payload {"sub":"u-1","email":"a@b.c"}
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"u-1","email":"a@b.c"}"#);
        let jwt = format!("{}.{}.sig", header, payload);

        let claims = decode_claims(&jwt).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn urlencode_escapes_reserved() {
        assert_eq!(urlencode("a b@c"), "a%20b%40c");
        assert_eq!(urlencode("safe-._~"), "safe-._~");
    }
}
