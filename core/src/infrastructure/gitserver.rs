// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ephemeral Git Server: a transient bare repository served over the git
//! smart-HTTP protocol, guarded by a one-time bearer token and exposed
//! through a reverse tunnel.
//!
//! The repository and its bearer exist only on the requester host for the
//! lifetime of one task. Teardown scrubs file contents before removal;
//! tmpfs destruction on process exit is the ultimate guarantee.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::task::TaskId;
use crate::infrastructure::paths;
use crate::infrastructure::tunnel::{TunnelClient, TunnelHandle};

const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;
const SCRUB_CAP: usize = 1024 * 1024;
const COMMIT_AUTHOR_NAME: &str = "HokiPoki";
const COMMIT_AUTHOR_EMAIL: &str = "tasks@hoki-poki.ai";

#[derive(Debug, Error)]
pub enum GitServerError {
    #[error("git subprocess failed: {0}")]
    Git(String),
    #[error("git server i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] crate::infrastructure::tunnel::TunnelError),
    #[error("git server is not started")]
    NotStarted,
}

/// What the provider needs to clone and push: public URL plus the bearer.
#[derive(Debug, Clone)]
pub struct GitServerConfig {
    pub url: String,
    pub bearer: String,
}

/// Result extraction output: the code diff and, when present, the AI review
/// the agent wrote to `AI_OUTPUT.md`.
#[derive(Debug, Clone, Default)]
pub struct RepoChanges {
    pub code_diff: String,
    pub ai_review: Option<String>,
}

impl RepoChanges {
    pub fn has_code_changes(&self) -> bool {
        !self.code_diff.trim().is_empty()
    }
}

struct GitHttpState {
    bearer: String,
    project_root: PathBuf,
}

pub struct EphemeralGitServer {
    task_id: TaskId,
    repo_dir: PathBuf,
    project_root: PathBuf,
    bearer: String,
    listen_port: Option<u16>,
    server: Option<JoinHandle<()>>,
    tunnel: Option<TunnelHandle>,
    public_url: Option<String>,
}

impl EphemeralGitServer {
    /// Create the bare repository and seed it with the task's input files.
    ///
    /// File paths are taken relative to the requester's current working
    /// directory; `..` components are stripped so inputs cannot land outside
    /// the work tree. Empty input seeds a placeholder file so the provider
    /// still has a tree to clone (testing affordance).
    pub async fn initialize(task_id: TaskId, files: &[PathBuf]) -> Result<Self, GitServerError> {
        let project_root = paths::tmp_dir();
        std::fs::create_dir_all(&project_root)?;
        paths::restrict_to_owner_dir(&project_root)?;
        let repo_dir = project_root.join(format!("{}.git", task_id));

        git(&["init", "--bare", path_str(&repo_dir)?], &project_root).await?;
        paths::restrict_to_owner_dir(&repo_dir)?;
        git(
            &["config", "http.receivepack", "true"],
            &repo_dir,
        )
        .await?;

        let work_dir = project_root.join(format!("{}.work", task_id));
        std::fs::create_dir_all(&work_dir)?;
        paths::restrict_to_owner_dir(&work_dir)?;
        git(&["init", "-b", "main", "."], &work_dir).await?;
        git(&["config", "user.name", COMMIT_AUTHOR_NAME], &work_dir).await?;
        git(&["config", "user.email", COMMIT_AUTHOR_EMAIL], &work_dir).await?;

        let cwd = std::env::current_dir()?;
        let mut copied = 0usize;
        for file in files {
            if let Some(destination) = stage_path(file, &cwd) {
                let target = work_dir.join(&destination);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match std::fs::copy(file, &target) {
                    Ok(_) => copied += 1,
                    Err(e) => warn!(file = %file.display(), "skipping unreadable input: {}", e),
                }
            } else {
                warn!(file = %file.display(), "skipping input outside the working directory");
            }
        }
        if copied == 0 {
            std::fs::write(
                work_dir.join("TASK.md"),
                "# Task workspace\n\nNo input files were provided.\n",
            )?;
        }

        git(&["add", "-A"], &work_dir).await?;
        git(&["commit", "-m", "Initial task files"], &work_dir).await?;
        git(
            &["remote", "add", "origin", path_str(&repo_dir)?],
            &work_dir,
        )
        .await?;
        git(&["push", "origin", "main"], &work_dir).await?;
        std::fs::remove_dir_all(&work_dir)?;
        restrict_tree(&repo_dir)?;

        let mut bearer_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bearer_bytes);
        let bearer = URL_SAFE_NO_PAD.encode(bearer_bytes);

        info!(task = %task_id, repo = %repo_dir.display(), "ephemeral repo initialized");

        Ok(Self {
            task_id,
            repo_dir,
            project_root,
            bearer,
            listen_port: None,
            server: None,
            tunnel: None,
            public_url: None,
        })
    }

    /// Bind the smart-HTTP service on a free port and attach the tunnel.
    pub async fn start(&mut self, tunnel: &TunnelClient) -> Result<GitServerConfig, GitServerError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        self.listen_port = Some(port);

        let state = Arc::new(GitHttpState {
            bearer: self.bearer.clone(),
            project_root: self.project_root.clone(),
        });
        let app = router(state);
        self.server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("git http server terminated: {}", e);
            }
        }));
        debug!(port = port, "git smart-http service listening");

        let handle = tunnel.open_tunnel(port, None).await?;
        let public_url = format!("{}/{}.git", handle.public_url, self.task_id);
        self.tunnel = Some(handle);
        self.public_url = Some(public_url);

        self.get_config()
    }

    pub fn get_config(&self) -> Result<GitServerConfig, GitServerError> {
        Ok(GitServerConfig {
            url: self.public_url.clone().ok_or(GitServerError::NotStarted)?,
            bearer: self.bearer.clone(),
        })
    }

    /// Local port the HTTP service is bound to, once started.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Clone the bare repo into a throwaway tree and derive the unified diff
    /// the provider's commit produced.
    pub async fn get_changes(&self) -> Result<RepoChanges, GitServerError> {
        let extract_dir = self.project_root.join(format!("{}.extract", self.task_id));
        if extract_dir.exists() {
            std::fs::remove_dir_all(&extract_dir)?;
        }

        git(
            &[
                "clone",
                path_str(&self.repo_dir)?,
                path_str(&extract_dir)?,
            ],
            &self.project_root,
        )
        .await?;

        let count: u32 = git(&["rev-list", "--count", "HEAD"], &extract_dir)
            .await?
            .trim()
            .parse()
            .map_err(|e| GitServerError::Git(format!("unparseable commit count: {}", e)))?;

        let diff = if count >= 2 {
            let root = git(&["rev-list", "--max-parents=0", "HEAD"], &extract_dir).await?;
            let root = root.trim().to_string();
            git(&["diff", &root, "HEAD"], &extract_dir).await?
        } else {
            git(&["show", "HEAD"], &extract_dir).await?
        };

        std::fs::remove_dir_all(&extract_dir)?;
        Ok(split_changes(&diff))
    }

    /// Tear everything down: tunnel, HTTP service, then scrub and remove the
    /// repository. Safe to call on every exit path.
    pub async fn stop(mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
        scrub_tree(&self.repo_dir);
        if let Err(e) = std::fs::remove_dir_all(&self.repo_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove ephemeral repo: {}", e);
            }
        }
        info!(task = %self.task_id, "ephemeral git server stopped");
    }
}

/// The smart-HTTP router: every request is authorized, then handed to the
/// `git http-backend` CGI.
fn router(state: Arc<GitHttpState>) -> Router {
    Router::new().fallback(serve_git).with_state(state)
}

async fn serve_git(
    State(state): State<Arc<GitHttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if !authorized(&state.bearer, &headers, uri.query()) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="Git""#)],
            "authentication required\n",
        )
            .into_response();
    }

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    match run_http_backend(&state.project_root, &method, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            warn!("git http-backend failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Bearer, Basic (username = bearer, password literally `x-oauth-basic`) or
/// a `?token=` query fallback.
fn authorized(bearer: &str, headers: &HeaderMap, query: Option<&str>) -> bool {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return constant_time_eq(token.trim(), bearer);
        }
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = STANDARD.decode(encoded.trim()) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    if let Some((user, pass)) = pair.split_once(':') {
                        return constant_time_eq(user, bearer) && pass == "x-oauth-basic";
                    }
                }
            }
        }
        return false;
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                return constant_time_eq(token, bearer);
            }
        }
    }

    false
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Invoke the git smart-HTTP CGI and translate its response.
async fn run_http_backend(
    project_root: &Path,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, GitServerError> {
    let mut command = tokio::process::Command::new("git");
    command
        .arg("http-backend")
        .env("GIT_PROJECT_ROOT", project_root)
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("REQUEST_METHOD", method.as_str())
        .env("PATH_INFO", uri.path())
        .env("QUERY_STRING", uri.query().unwrap_or(""))
        .env("REMOTE_ADDR", "127.0.0.1")
        .env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("SERVER_PROTOCOL", "HTTP/1.1")
        .env("CONTENT_LENGTH", body.len().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        command.env("CONTENT_TYPE", content_type);
    }

    let mut child = command
        .spawn()
        .map_err(|e| GitServerError::Git(format!("cannot spawn git http-backend: {}", e)))?;

    // Drain stdin and stdout concurrently; receive-pack bodies can exceed the
    // pipe buffer in both directions.
    let mut stdin = child.stdin.take().expect("stdin piped");
    let body_owned = body.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&body_owned).await;
        let _ = stdin.shutdown().await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| GitServerError::Git(e.to_string()))?;
    let _ = writer.await;

    if !output.status.success() {
        return Err(GitServerError::Git(format!(
            "http-backend exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(parse_cgi_response(&output.stdout))
}

/// Split a CGI response into headers and body.
fn parse_cgi_response(raw: &[u8]) -> Response {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, i + 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2)));

    let Some((header_end, body_start)) = split else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    for line in String::from_utf8_lossy(&raw[..header_end]).lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("Status") {
            if let Some(code) = value.split_whitespace().next() {
                if let Ok(parsed) = code.parse::<u16>() {
                    status = StatusCode::from_u16(parsed).unwrap_or(StatusCode::OK);
                }
            }
        } else {
            builder = builder.header(name, value);
        }
    }

    builder
        .status(status)
        .body(Body::from(raw[body_start..].to_vec()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Where an input file lands inside the work tree, or `None` when it cannot
/// be staged safely. `..` components are stripped.
fn stage_path(file: &Path, cwd: &Path) -> Option<PathBuf> {
    let relative = match file.strip_prefix(cwd) {
        Ok(stripped) => stripped.to_path_buf(),
        Err(_) if file.is_absolute() => PathBuf::from(file.file_name()?),
        Err(_) => file.to_path_buf(),
    };

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            std::path::Component::Normal(part) => clean.push(part),
            std::path::Component::ParentDir
            | std::path::Component::RootDir
            | std::path::Component::Prefix(_)
            | std::path::Component::CurDir => {}
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Separate the `AI_OUTPUT.md` diff section from the code changes. The AI
/// review payload is the added content of that section.
pub fn split_changes(diff: &str) -> RepoChanges {
    let mut code_sections = String::new();
    let mut ai_lines: Vec<String> = Vec::new();
    let mut in_ai_section = false;
    let mut seen_any_section = false;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            seen_any_section = true;
            in_ai_section = line.contains("AI_OUTPUT.md");
        }
        if in_ai_section {
            if let Some(added) = line.strip_prefix('+') {
                if !added.starts_with("++") {
                    ai_lines.push(added.to_string());
                }
            }
        } else if seen_any_section {
            code_sections.push_str(line);
            code_sections.push('\n');
        }
    }

    // `git show` output carries a commit header before the first section;
    // keep nothing unless a real diff section followed.
    RepoChanges {
        code_diff: code_sections,
        ai_review: if ai_lines.is_empty() {
            None
        } else {
            Some(ai_lines.join("\n"))
        },
    }
}

/// Owner-only permissions over the whole repository tree: 0600 for files,
/// 0700 for directories. git creates pack and object files world-readable.
fn restrict_tree(root: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            paths::restrict_to_owner_dir(entry.path())?;
        } else {
            paths::restrict_to_owner(entry.path())?;
        }
    }
    Ok(())
}

fn scrub_tree(root: &Path) {
    let mut rng = rand::thread_rng();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata().map(|m| m.len() as usize).unwrap_or(0);
        let mut noise = vec![0u8; len.min(SCRUB_CAP)];
        rand::RngCore::fill_bytes(&mut rng, &mut noise);
        if let Err(e) = std::fs::write(entry.path(), &noise) {
            debug!(file = %entry.path().display(), "scrub skipped: {}", e);
        }
    }
}

async fn git(args: &[&str], cwd: &Path) -> Result<String, GitServerError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| GitServerError::Git(format!("cannot run git: {}", e)))?;

    if !output.status.success() {
        return Err(GitServerError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn path_str(path: &Path) -> Result<&str, GitServerError> {
    path.to_str()
        .ok_or_else(|| GitServerError::Git(format!("non-utf8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_has_at_least_256_bits() {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let bearer = URL_SAFE_NO_PAD.encode(bytes);
        assert!(bearer.len() >= 32);
        assert_eq!(URL_SAFE_NO_PAD.decode(&bearer).unwrap().len(), 32);
    }

    #[test]
    fn authorization_accepts_all_three_forms() {
        let bearer = "secret-bearer-token-of-sufficient-len";
        let mut headers = HeaderMap::new();

        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", bearer).parse().unwrap(),
        );
        assert!(authorized(bearer, &headers, None));

        let basic = STANDARD.encode(format!("{}:x-oauth-basic", bearer));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", basic).parse().unwrap(),
        );
        assert!(authorized(bearer, &headers, None));

        let empty = HeaderMap::new();
        assert!(authorized(
            bearer,
            &empty,
            Some(&format!("service=git-upload-pack&token={}", bearer))
        ));
    }

    #[test]
    fn authorization_rejects_wrong_credentials() {
        let bearer = "secret-bearer-token-of-sufficient-len";
        let mut headers = HeaderMap::new();

        assert!(!authorized(bearer, &headers, None));
        assert!(!authorized(bearer, &headers, Some("token=wrong")));

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!authorized(bearer, &headers, None));

        // Basic with the wrong password is refused even with the right user.
        let basic = STANDARD.encode(format!("{}:hunter2", bearer));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", basic).parse().unwrap(),
        );
        assert!(!authorized(bearer, &headers, None));
    }

    #[tokio::test]
    async fn unauthorized_request_gets_401_with_challenge() {
        let state = Arc::new(GitHttpState {
            bearer: "the-bearer".into(),
            project_root: std::env::temp_dir(),
        });
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });

        let response = reqwest::get(format!(
            "http://{}/abc.git/info/refs?service=git-upload-pack",
            addr
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(
            response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok()),
            Some(r#"Basic realm="Git""#)
        );
        server.abort();
    }

    #[test]
    fn stage_path_strips_escapes() {
        let cwd = Path::new("/work/project");
        assert_eq!(
            stage_path(Path::new("src/main.rs"), cwd).unwrap(),
            PathBuf::from("src/main.rs")
        );
        assert_eq!(
            stage_path(Path::new("../../etc/passwd"), cwd).unwrap(),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            stage_path(Path::new("/work/project/a.txt"), cwd).unwrap(),
            PathBuf::from("a.txt")
        );
        assert!(stage_path(Path::new("../.."), cwd).is_none());
    }

    #[test]
    fn split_changes_separates_ai_review() {
        let diff = "\
diff --git a/a.txt b/a.txt
index 111..222 100644
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-helo
+hello
diff --git a/AI_OUTPUT.md b/AI_OUTPUT.md
new file mode 100644
index 000..333
--- /dev/null
+++ b/AI_OUTPUT.md
@@ -0,0 +2 @@
+Fixed the typo in a.txt.
+All tests pass.
";
        let changes = split_changes(diff);
        assert!(changes.code_diff.contains("+hello"));
        assert!(!changes.code_diff.contains("AI_OUTPUT.md"));
        let review = changes.ai_review.unwrap();
        assert!(review.contains("Fixed the typo"));
        assert!(review.contains("All tests pass."));
    }

    #[test]
    fn split_changes_with_only_ai_output_has_no_code() {
        let diff = "\
diff --git a/AI_OUTPUT.md b/AI_OUTPUT.md
new file mode 100644
--- /dev/null
+++ b/AI_OUTPUT.md
@@ -0,0 +1 @@
+Review only, nothing to change.
";
        let changes = split_changes(diff);
        assert!(!changes.has_code_changes());
        assert!(changes.ai_review.is_some());
    }

    #[test]
    fn cgi_response_parsing() {
        let raw = b"Status: 200 OK\r\nContent-Type: application/x-git-upload-pack-advertisement\r\n\r\npayload";
        let response = parse_cgi_response(raw);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/x-git-upload-pack-advertisement")
        );
    }
}
