// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! On-disk layout under `~/.hokipoki/`.
//!
//! ```text
//! key.secret           32-byte AES-GCM key, perms 0600
//! keycloak_token.enc   sealed IdentityToken
//! tunnel_config.enc    sealed TunnelConfig
//! tokens.enc           sealed array of ToolCredential
//! bin/<tunnel-binary>
//! tmp/<taskId>.git/    transient bare repo
//! ```

use std::path::PathBuf;

pub const ENVELOPE_IDENTITY: &str = "keycloak_token";
pub const ENVELOPE_TUNNEL: &str = "tunnel_config";
pub const ENVELOPE_TOOLS: &str = "tokens";

pub fn base_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".hokipoki")
}

pub fn key_file() -> PathBuf {
    base_dir().join("key.secret")
}

pub fn envelope_file(stem: &str) -> PathBuf {
    base_dir().join(format!("{}.enc", stem))
}

pub fn bin_dir() -> PathBuf {
    base_dir().join("bin")
}

pub fn tmp_dir() -> PathBuf {
    base_dir().join("tmp")
}

/// Create the base directory, restricted to the owner.
pub fn ensure_base_dir() -> std::io::Result<PathBuf> {
    let dir = base_dir();
    std::fs::create_dir_all(&dir)?;
    restrict_to_owner_dir(&dir)?;
    Ok(dir)
}

#[cfg(unix)]
pub fn restrict_to_owner(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_to_owner(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn restrict_to_owner_dir(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
pub fn restrict_to_owner_dir(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
