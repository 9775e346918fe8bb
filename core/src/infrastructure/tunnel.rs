// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tunnel Client: reverse-tunnel provisioning through an frp-style gateway.
//!
//! The gateway itself is external; this module locates or downloads the
//! client binary, writes a per-tunnel configuration, spawns the process and
//! tears it down again. The tunnel presents a plaintext public URL; it
//! performs no TLS termination.

use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::domain::credential::TunnelConfig;
use crate::domain::settings::Settings;
use crate::infrastructure::backend::{BackendClient, BackendError};
use crate::infrastructure::paths;
use crate::infrastructure::vault::Vault;

const FRP_VERSION: &str = "0.58.1";
const SPAWN_GRACE_MS: u64 = 1500;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel client binary unavailable: {0}")]
    BinaryUnavailable(String),
    #[error("failed to spawn tunnel: {0}")]
    SpawnFailed(String),
    #[error("tunnel configuration unavailable: {0}")]
    ConfigUnavailable(String),
    #[error("tunnel i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve gateway coordinates: environment overrides win, then the sealed
/// 24-hour cache, then a backend fetch (which refreshes the cache).
pub async fn resolve_config(
    settings: &Settings,
    backend: &BackendClient,
    vault: &Vault,
) -> Result<TunnelConfig, TunnelError> {
    if let Some(config) = settings.env_tunnel_config() {
        debug!("using tunnel config from environment");
        return Ok(config);
    }

    if let Ok(Some(cached)) = vault.load_json::<TunnelConfig>(paths::ENVELOPE_TUNNEL) {
        if !cached.is_stale(Utc::now()) {
            debug!("using cached tunnel config");
            return Ok(cached);
        }
    }

    let fetched = backend.tunnel_config().await.map_err(|e| match e {
        BackendError::Unauthorized => {
            TunnelError::ConfigUnavailable("backend rejected the token - run `hokipoki login`".into())
        }
        other => TunnelError::ConfigUnavailable(other.to_string()),
    })?;

    if let Err(e) = vault.store_json(paths::ENVELOPE_TUNNEL, &fetched) {
        warn!("could not cache tunnel config: {}", e);
    }
    Ok(fetched)
}

pub struct TunnelClient {
    config: TunnelConfig,
    bin_dir: PathBuf,
    config_dir: PathBuf,
}

pub struct TunnelHandle {
    pub public_url: String,
    pub subdomain: String,
    child: Child,
    config_path: PathBuf,
}

impl TunnelHandle {
    /// Kill the tunnel process and remove its configuration file.
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("tunnel process did not die cleanly: {}", e);
        }
        let _ = self.child.wait().await;
        if let Err(e) = std::fs::remove_file(&self.config_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove tunnel config: {}", e);
            }
        }
        debug!(subdomain = %self.subdomain, "tunnel closed");
    }
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            bin_dir: paths::bin_dir(),
            config_dir: paths::tmp_dir(),
        }
    }

    /// Locate the tunnel client in `PATH` or our bin dir, downloading the
    /// pinned release when absent.
    pub async fn ensure_binary(&self) -> Result<PathBuf, TunnelError> {
        if let Some(found) = find_in_path("frpc") {
            debug!(path = %found.display(), "using frpc from PATH");
            return Ok(found);
        }

        let local = self.bin_dir.join(binary_name());
        if local.exists() {
            return Ok(local);
        }

        self.download_binary(&local).await?;
        Ok(local)
    }

    /// Spawn a named tunnel for a local port and return its public endpoint.
    pub async fn open_tunnel(
        &self,
        local_port: u16,
        subdomain: Option<String>,
    ) -> Result<TunnelHandle, TunnelError> {
        let binary = self.ensure_binary().await?;
        let subdomain = subdomain.unwrap_or_else(random_subdomain);

        std::fs::create_dir_all(&self.config_dir)?;
        let config_path = self.config_dir.join(format!("frpc-{}.toml", subdomain));
        std::fs::write(&config_path, self.render_config(local_port, &subdomain))?;
        paths::restrict_to_owner(&config_path)?;

        let child = Command::new(&binary)
            .arg("-c")
            .arg(&config_path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed(format!("{}: {}", binary.display(), e)))?;

        // Give the client a moment to register; a dead child here means the
        // gateway rejected us (bad token, duplicate subdomain).
        tokio::time::sleep(std::time::Duration::from_millis(SPAWN_GRACE_MS)).await;
        let mut child = child;
        if let Ok(Some(status)) = child.try_wait() {
            let _ = std::fs::remove_file(&config_path);
            return Err(TunnelError::SpawnFailed(format!(
                "tunnel client exited immediately ({})",
                status
            )));
        }

        let public_url = self.public_url(&subdomain);
        info!(subdomain = %subdomain, url = %public_url, "tunnel established");

        Ok(TunnelHandle {
            public_url,
            subdomain,
            child,
            config_path,
        })
    }

    /// Host the public URL resolves to, for container DNS mapping.
    pub fn public_host(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.config.subdomain_host)
    }

    fn public_url(&self, subdomain: &str) -> String {
        let host = self.public_host(subdomain);
        if self.config.public_http_port == 80 {
            format!("http://{}", host)
        } else {
            format!("http://{}:{}", host, self.config.public_http_port)
        }
    }

    fn render_config(&self, local_port: u16, subdomain: &str) -> String {
        format!(
            r#"serverAddr = "{server_addr}"
serverPort = {server_port}

[auth]
method = "token"
token = "{token}"

[[proxies]]
name = "hokipoki-{subdomain}"
type = "http"
localIP = "127.0.0.1"
localPort = {local_port}
subdomain = "{subdomain}"
"#,
            server_addr = self.config.server_addr,
            server_port = self.config.server_port,
            token = self.config.token,
            local_port = local_port,
            subdomain = subdomain,
        )
    }

    async fn download_binary(&self, destination: &Path) -> Result<(), TunnelError> {
        let (os, arch) = release_platform().ok_or_else(|| {
            TunnelError::BinaryUnavailable(format!(
                "no pinned frp release for {}/{} - install frpc on PATH",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        })?;

        let release = format!("frp_{}_{}_{}", FRP_VERSION, os, arch);
        let url = format!(
            "https://github.com/fatedier/frp/releases/download/v{}/{}.tar.gz",
            FRP_VERSION, release
        );
        info!(url = %url, "downloading tunnel client");

        let bytes = reqwest::get(&url)
            .await
            .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?;

        let wanted = format!("{}/{}", release, binary_name());
        let decoder = flate2::read::GzDecoder::new(bytes.as_ref());
        let mut archive = tar::Archive::new(decoder);

        std::fs::create_dir_all(&self.bin_dir)?;
        for entry in archive
            .entries()
            .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            if path == wanted {
                entry
                    .unpack(destination)
                    .map_err(|e| TunnelError::BinaryUnavailable(e.to_string()))?;
                make_executable(destination)?;
                info!(path = %destination.display(), "tunnel client installed");
                return Ok(());
            }
        }

        Err(TunnelError::BinaryUnavailable(format!(
            "release archive had no {} member",
            wanted
        )))
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "frpc.exe"
    } else {
        "frpc"
    }
}

fn release_platform() -> Option<(&'static str, &'static str)> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        _ => return None,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => return None,
    };
    Some((os, arch))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

const ADJECTIVES: [&str; 16] = [
    "calm", "brave", "sunny", "quiet", "swift", "merry", "bold", "clever", "dusty", "eager",
    "fuzzy", "gentle", "happy", "jolly", "keen", "lucky",
];

const ANIMALS: [&str; 16] = [
    "otter", "falcon", "badger", "lynx", "heron", "newt", "panda", "raven", "seal", "tiger",
    "vole", "wren", "yak", "zebra", "moose", "ibex",
];

/// `<adj>-<animal>-<0..99>`, used when the caller does not pin a subdomain.
pub fn random_subdomain() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())],
        rng.gen_range(0..100u8)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_shape() {
        let re = regex::Regex::new(r"^[a-z]+-[a-z]+-\d{1,2}$").unwrap();
        for _ in 0..50 {
            let name = random_subdomain();
            assert!(re.is_match(&name), "bad subdomain: {}", name);
        }
    }

    #[test]
    fn config_render_includes_proxy_block() {
        let client = TunnelClient::new(TunnelConfig {
            token: "shared".into(),
            server_addr: "frp.example.com".into(),
            server_port: 7000,
            subdomain_host: "tunnel.example.com".into(),
            public_http_port: 8080,
            fetched_at: Utc::now(),
        });

        let rendered = client.render_config(41234, "calm-otter-7");
        assert!(rendered.contains(r#"serverAddr = "frp.example.com""#));
        assert!(rendered.contains("localPort = 41234"));
        assert!(rendered.contains(r#"subdomain = "calm-otter-7""#));
        assert!(rendered.contains(r#"token = "shared""#));
    }

    #[test]
    fn public_url_elides_default_port() {
        let mut config = TunnelConfig {
            token: "t".into(),
            server_addr: "frp".into(),
            server_port: 7000,
            subdomain_host: "tunnel.example.com".into(),
            public_http_port: 80,
            fetched_at: Utc::now(),
        };
        let client = TunnelClient::new(config.clone());
        assert_eq!(
            client.public_url("calm-otter-7"),
            "http://calm-otter-7.tunnel.example.com"
        );

        config.public_http_port = 8080;
        let client = TunnelClient::new(config);
        assert_eq!(
            client.public_url("calm-otter-7"),
            "http://calm-otter-7.tunnel.example.com:8080"
        );
    }
}
