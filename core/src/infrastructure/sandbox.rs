// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sandbox Executor, host side.
//!
//! Spawns the encrypted-workspace container for one task, injects the
//! credentials through the environment, uploads and runs the in-container
//! executor, and supervises its output. The container gets exactly the
//! privileges LUKS-on-loop needs and nothing more; the cloned code only ever
//! exists inside the keyed tmpfs image the executor manages.

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::credential::AiTool;
use crate::domain::task::TaskId;

pub const SANDBOX_IMAGE: &str = "hokipoki-sandbox:latest";
const CONTAINER_PREFIX: &str = "hokipoki-";
const EXECUTOR_CONTAINER_PATH: &str = "/usr/local/bin/";
const EXECUTOR_BINARY: &str = "hokipoki-sandbox-exec";
const MEMORY_LIMIT_BYTES: i64 = 1024 * 1024 * 1024;
const PIDS_LIMIT: i64 = 200;
/// The executor enforces the 20-minute AI wall clock itself; the host allows
/// extra headroom for clone, push and teardown.
const SUPERVISION_TIMEOUT_SECS: u64 = 25 * 60;
const OUTPUT_CAP: usize = 10 * 1024 * 1024;

pub const COMMIT_SENTINEL_OPEN: &str = "[HOKIPOKI_COMMIT_MESSAGE]";
pub const COMMIT_SENTINEL_CLOSE: &str = "[/HOKIPOKI_COMMIT_MESSAGE]";

const SANDBOX_DOCKERFILE: &str = r#"FROM node:20-bookworm
RUN apt-get update \
    && apt-get install -y --no-install-recommends cryptsetup e2fsprogs git util-linux \
    && rm -rf /var/lib/apt/lists/*
RUN npm install -g @anthropic-ai/claude-code @openai/codex @google/gemini-cli
"#;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(
        "cannot connect to Docker: {0}\n\n\
         Ensure Docker is running and your user can reach the socket:\n\
         - Linux: systemctl start docker; add yourself to the 'docker' group\n\
         - macOS/Windows: start Docker Desktop\n\
         Verify with: docker ps"
    )]
    Connect(String),
    #[error("failed to build sandbox image: {0}")]
    ImageBuild(String),
    #[error("failed to spawn sandbox container: {0}")]
    SpawnFailed(String),
    #[error("sandbox execution failed: {0}")]
    ExecutionFailed(String),
    #[error(
        "the AI tool credentials were rejected inside the sandbox (401 Unauthorized) - \
         re-authenticate the tool and try again"
    )]
    AuthRejected,
    #[error("sandbox execution exceeded the supervision timeout")]
    Timeout,
}

/// Everything the container needs for one task.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub task_id: TaskId,
    pub git_url: String,
    pub git_token: String,
    pub tool: AiTool,
    pub model: Option<String>,
    pub task_description: String,
    /// Double-encoded native credential blob, forwarded verbatim.
    pub oauth_blob: String,
    /// Tunnel hostname that must resolve to the host gateway inside the
    /// container so the public git URL reaches the requester's tunnel.
    pub public_host: String,
}

#[derive(Debug, Clone, Default)]
pub struct SandboxOutcome {
    pub commit_summary: Option<String>,
}

#[derive(Clone)]
pub struct SandboxRunner {
    docker: Docker,
    executor_path: PathBuf,
    debug_pause: bool,
}

impl SandboxRunner {
    pub fn new(debug_pause: bool) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Connect(e.to_string()))?;
        Ok(Self {
            docker,
            executor_path: locate_executor(),
            debug_pause,
        })
    }

    /// Run one task to completion. The container is force-removed on every
    /// exit path.
    pub async fn run(&self, request: &SandboxRequest) -> Result<SandboxOutcome, SandboxError> {
        self.ensure_image().await?;

        let name = container_name(request.task_id);
        let outcome = self.run_in_container(&name, request).await;

        if self.debug_pause {
            warn!(container = %name, "DEBUG_PAUSE set - holding container for 5 minutes");
            tokio::time::sleep(std::time::Duration::from_secs(300)).await;
        }
        self.force_remove(&name).await;
        outcome
    }

    /// Kill and remove the container for a cancelled task.
    pub async fn kill_task(&self, task_id: TaskId) {
        self.force_remove(&container_name(task_id)).await;
    }

    async fn run_in_container(
        &self,
        name: &str,
        request: &SandboxRequest,
    ) -> Result<SandboxOutcome, SandboxError> {
        // A previous run of the same task may have left a container behind.
        self.force_remove(name).await;

        let mut env = vec![
            format!("TASK_ID={}", request.task_id),
            format!("GIT_URL={}", request.git_url),
            format!("GIT_TOKEN={}", request.git_token),
            format!("AI_TOOL={}", request.tool),
            format!("TASK_DESCRIPTION={}", request.task_description),
            format!("OAUTH_TOKEN={}", request.oauth_blob),
        ];
        if let Some(model) = &request.model {
            env.push(format!("AI_MODEL={}", model));
        }

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/workspace".to_string(), "rw,size=300m,mode=0755".to_string());
        tmpfs.insert("/tmp".to_string(), "rw,size=50m,mode=1777".to_string());

        let host_config = bollard::service::HostConfig {
            cap_add: Some(vec!["SYS_ADMIN".to_string(), "MKNOD".to_string()]),
            // loop devices are block major 7, loop-control and dm-control are
            // char major 10, device-mapper block devices get dynamic majors.
            device_cgroup_rules: Some(vec![
                "b 7:* rmw".to_string(),
                "c 10:* rmw".to_string(),
                "b 252:* rmw".to_string(),
                "b 253:* rmw".to_string(),
                "b 254:* rmw".to_string(),
            ]),
            memory: Some(MEMORY_LIMIT_BYTES),
            memory_swap: Some(MEMORY_LIMIT_BYTES),
            pids_limit: Some(PIDS_LIMIT),
            tmpfs: Some(tmpfs),
            extra_hosts: Some(vec![format!("{}:host-gateway", request.public_host)]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(SANDBOX_IMAGE.to_string()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::SpawnFailed(format!("failed to start container: {}", e)))?;
        info!(container = %name, "sandbox container started");

        self.upload_executor(name).await?;

        let supervise = self.supervise_executor(name);
        match tokio::time::timeout(
            std::time::Duration::from_secs(SUPERVISION_TIMEOUT_SECS),
            supervise,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout),
        }
    }

    /// Exec the uploaded executor and watch its output for the commit
    /// sentinel and credential rejections.
    async fn supervise_executor(&self, name: &str) -> Result<SandboxOutcome, SandboxError> {
        let exec_config = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec![format!(
                "{}{}",
                EXECUTOR_CONTAINER_PATH, EXECUTOR_BINARY
            )]),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(name, exec_config)
            .await
            .map_err(|e| SandboxError::ExecutionFailed(e.to_string()))?;

        let results = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::ExecutionFailed(e.to_string()))?;

        let mut combined = String::new();
        let mut auth_rejected = false;

        if let StartExecResults::Attached { mut output, .. } = results {
            while let Some(message) = output.next().await {
                let chunk = match message {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        String::from_utf8_lossy(&message).into_owned()
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(container = %name, "log stream error: {}", e);
                        break;
                    }
                };
                debug!(container = %name, "executor: {}", chunk.trim_end());
                if detect_auth_rejection(&chunk) {
                    auth_rejected = true;
                }
                if combined.len() < OUTPUT_CAP {
                    combined.push_str(&chunk);
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::ExecutionFailed(format!("inspect failed: {}", e)))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        if auth_rejected {
            return Err(SandboxError::AuthRejected);
        }
        if exit_code != 0 {
            return Err(SandboxError::ExecutionFailed(format!(
                "executor exited with code {}",
                exit_code
            )));
        }

        Ok(SandboxOutcome {
            commit_summary: extract_commit_summary(&combined),
        })
    }

    /// Build the sandbox image from the embedded Dockerfile when absent.
    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(SANDBOX_IMAGE).await.is_ok() {
            return Ok(());
        }

        info!(image = SANDBOX_IMAGE, "sandbox image not found, building");
        let context = dockerfile_context()?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: SANDBOX_IMAGE.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(update) = stream.next().await {
            match update {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(SandboxError::ImageBuild(error));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!("build: {}", line);
                        }
                    }
                }
                Err(e) => return Err(SandboxError::ImageBuild(e.to_string())),
            }
        }
        info!(image = SANDBOX_IMAGE, "sandbox image ready");
        Ok(())
    }

    /// Ship the executor binary into the container as a tar stream.
    async fn upload_executor(&self, name: &str) -> Result<(), SandboxError> {
        let binary = std::fs::read(&self.executor_path).map_err(|e| {
            SandboxError::SpawnFailed(format!(
                "cannot read executor binary at {}: {} (is {} installed next to the CLI?)",
                self.executor_path.display(),
                e,
                EXECUTOR_BINARY
            ))
        })?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header
            .set_path(EXECUTOR_BINARY)
            .map_err(|e| SandboxError::SpawnFailed(format!("tar path: {}", e)))?;
        header.set_size(binary.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append(&header, binary.as_slice())
            .map_err(|e| SandboxError::SpawnFailed(format!("tar append: {}", e)))?;
        let archive = builder
            .into_inner()
            .map_err(|e| SandboxError::SpawnFailed(format!("tar finalize: {}", e)))?;

        let options = UploadToContainerOptions {
            path: EXECUTOR_CONTAINER_PATH,
            ..Default::default()
        };
        self.docker
            .upload_to_container(name, Some(options), archive.into())
            .await
            .map_err(|e| SandboxError::SpawnFailed(format!("executor upload failed: {}", e)))?;
        debug!(container = %name, "executor binary uploaded");
        Ok(())
    }

    async fn force_remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => info!(container = %name, "container removed"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => debug!(container = %name, "remove skipped: {}", e),
        }
    }
}

pub fn container_name(task_id: TaskId) -> String {
    format!("{}{}", CONTAINER_PREFIX, task_id)
}

/// The executor binary ships alongside the CLI binary.
fn locate_executor() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(EXECUTOR_BINARY)))
        .unwrap_or_else(|| PathBuf::from(EXECUTOR_BINARY))
}

fn dockerfile_context() -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header
        .set_path("Dockerfile")
        .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;
    header.set_size(SANDBOX_DOCKERFILE.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, SANDBOX_DOCKERFILE.as_bytes())
        .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::ImageBuild(e.to_string()))
}

/// Pull the sentinel-bracketed commit summary out of the executor output.
pub fn extract_commit_summary(output: &str) -> Option<String> {
    let start = output.find(COMMIT_SENTINEL_OPEN)? + COMMIT_SENTINEL_OPEN.len();
    let end = output[start..].find(COMMIT_SENTINEL_CLOSE)? + start;
    let summary = output[start..end].trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

pub fn detect_auth_rejection(chunk: &str) -> bool {
    chunk.contains("401 Unauthorized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_extraction() {
        let output = "cloning...\n[HOKIPOKI_COMMIT_MESSAGE]HokiPoki claude: Fixed the typo[/HOKIPOKI_COMMIT_MESSAGE]\npushed\n";
        assert_eq!(
            extract_commit_summary(output).as_deref(),
            Some("HokiPoki claude: Fixed the typo")
        );

        assert!(extract_commit_summary("no sentinel here").is_none());
        assert!(extract_commit_summary("[HOKIPOKI_COMMIT_MESSAGE]unterminated").is_none());
        assert!(
            extract_commit_summary("[HOKIPOKI_COMMIT_MESSAGE]  [/HOKIPOKI_COMMIT_MESSAGE]")
                .is_none()
        );
    }

    #[test]
    fn sentinel_survives_surrounding_noise() {
        let output = format!(
            "{}{}{}",
            "x".repeat(100),
            "[HOKIPOKI_COMMIT_MESSAGE]summary text[/HOKIPOKI_COMMIT_MESSAGE]",
            "y".repeat(100)
        );
        assert_eq!(extract_commit_summary(&output).as_deref(), Some("summary text"));
    }

    #[test]
    fn auth_rejection_detection() {
        assert!(detect_auth_rejection(
            "fatal: unable to access 'http://...': The requested URL returned error: 401 Unauthorized"
        ));
        assert!(!detect_auth_rejection("error: 403 Forbidden"));
    }

    #[test]
    fn container_names_are_prefixed_by_task() {
        let id = TaskId::new();
        let name = container_name(id);
        assert!(name.starts_with("hokipoki-"));
        assert!(name.contains(&id.to_string()));
    }
}
