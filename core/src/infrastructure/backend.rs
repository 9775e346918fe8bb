// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the Marketplace Backend API.
//!
//! The backend persists task records for the dashboard, owns workspace
//! membership and issues tunnel configuration. Most calls here are advisory
//! for the core flows: callers log and continue when dashboard logging fails,
//! but bubble errors where the data is load-bearing (profile, tunnel config).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::credential::{AiTool, TunnelConfig};
use crate::domain::task::{Task, TaskStatus};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rejected the request (HTTP 401) - run `hokipoki login`")]
    Unauthorized,
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("backend unreachable: {0}")]
    Network(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Network(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_personal: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
}

impl Profile {
    /// The workspace a command operates in when `--workspace` is not given:
    /// the profile default, else the personal workspace, else the first one.
    pub fn default_workspace(&self) -> Option<String> {
        if let Some(id) = &self.workspace_id {
            return Some(id.clone());
        }
        self.workspaces
            .iter()
            .find(|w| w.is_personal.unwrap_or(false))
            .or_else(|| self.workspaces.first())
            .map(|w| w.id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTasks {
    pub has_active_tasks: bool,
    #[serde(default)]
    pub active_tasks: Vec<serde_json::Value>,
}

/// Task record shape the dashboard expects on upsert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub tool: AiTool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub credits: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            tool: task.tool,
            model: task.model.clone(),
            description: task.description.clone(),
            status: task.status,
            credits: task.credits,
            created_at: task.created_at,
            completed_at: task.completed_at,
            provider_id: task.provider_id.map(|p| p.to_string()),
            summary: task.commit_summary.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: access_token.into(),
        }
    }

    pub async fn profile(&self) -> Result<Profile, BackendError> {
        self.get_json("/api/profile").await
    }

    pub async fn tunnel_config(&self) -> Result<TunnelConfig, BackendError> {
        self.get_json("/api/tunnel/token").await
    }

    pub async fn provider_tools(&self) -> Result<Vec<AiTool>, BackendError> {
        #[derive(Deserialize)]
        struct Tools {
            tools: Vec<AiTool>,
        }
        let tools: Tools = self.get_json("/api/provider/tools").await?;
        Ok(tools.tools)
    }

    pub async fn register_provider_tools(&self, tools: &[AiTool]) -> Result<(), BackendError> {
        self.post_json("/api/provider/tools", &serde_json::json!({ "tools": tools }))
            .await
    }

    pub async fn active_tasks(&self) -> Result<ActiveTasks, BackendError> {
        self.get_json("/api/tasks/active").await
    }

    pub async fn upsert_task(&self, record: &TaskRecord) -> Result<(), BackendError> {
        self.post_json("/api/tasks", record).await
    }

    pub async fn bind_provider(
        &self,
        task_id: &str,
        provider_id: &str,
    ) -> Result<(), BackendError> {
        let url = format!("{}/api/tasks/{}/provider", self.base_url, task_id);
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "providerId": provider_id }))
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), BackendError> {
        self.post_json(
            &format!("/api/tasks/{}/cancel", task_id),
            &serde_json::json!({}),
        )
        .await
    }

    /// Signal-path cancel with a hard network timeout so teardown never hangs.
    pub async fn cancel_task_with_timeout(&self, task_id: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.cancel_task(task_id)).await,
            Ok(Ok(()))
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, BackendError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), BackendError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response.json().await.map_err(|e| BackendError::Http {
            status: status.as_u16(),
            body: format!("unparseable response: {}", e),
        })
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), BackendError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_workspace_prefers_profile_then_personal() {
        let mut profile = Profile {
            id: "u".into(),
            email: "a@b.c".into(),
            workspace_id: None,
            workspaces: vec![
                Workspace {
                    id: "team".into(),
                    name: "Team".into(),
                    is_personal: Some(false),
                },
                Workspace {
                    id: "personal".into(),
                    name: "Personal".into(),
                    is_personal: Some(true),
                },
            ],
        };
        assert_eq!(profile.default_workspace().as_deref(), Some("personal"));

        profile.workspace_id = Some("team".into());
        assert_eq!(profile.default_workspace().as_deref(), Some("team"));
    }

    #[test]
    fn task_record_serializes_camel_case() {
        let task = Task::new(
            crate::domain::peer::PeerId::new(),
            AiTool::Claude,
            Some("opus".into()),
            "desc".into(),
            "ws".into(),
            2.5,
        );
        let record = TaskRecord::from(&task);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["status"], "pending");
        assert_eq!(json["tool"], "claude");
        assert!(json.get("completedAt").is_none());
    }
}
