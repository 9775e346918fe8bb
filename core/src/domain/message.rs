// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Relay wire protocol.
//!
//! Every frame on the relay socket is a single UTF-8 JSON object with a
//! `type` discriminator. The relay inspects only the outer frame; P2P payloads
//! travel opaque inside `p2p_relay` frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::credential::AiTool;
use crate::domain::peer::PeerId;
use crate::domain::task::{Task, TaskId};

/// One relay frame. Variant tags are the `type` values on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// First frame from every peer; anything else disconnects.
    Authenticate { token: String },
    #[serde(rename_all = "camelCase")]
    ConnectionConfirmed { peer_id: PeerId },

    RegisterProvider { payload: ProviderRegistration },
    RegisterRequester { payload: RequesterRegistration },

    PublishTask { payload: PublishTask },
    #[serde(rename_all = "camelCase")]
    TaskPublished { task_id: TaskId },
    NewTask { task: Task },
    #[serde(rename_all = "camelCase")]
    AcceptTask { task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    DeclineTask { task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    TaskMatched { task_id: TaskId, provider_id: PeerId },
    #[serde(rename_all = "camelCase")]
    TaskAccepted { task_id: TaskId, requester_id: PeerId },
    NoProvidersAvailable {
        tool: AiTool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    P2pRelay {
        from: PeerId,
        to: PeerId,
        payload: P2pEnvelope,
    },

    #[serde(rename_all = "camelCase")]
    CancelTask {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskCancelled {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistration {
    pub tools: Vec<AiTool>,
    pub workspace_ids: Vec<String>,
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterRegistration {
    pub workspace_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishTask {
    pub tool: AiTool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub task: String,
    pub description: String,
    pub estimated_duration: u64,
    pub credits: f64,
    pub workspace_id: String,
}

/// The envelope relayed verbatim between matched peers: `{type, payload,
/// timestamp}`. The relay never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pEnvelope {
    #[serde(flatten)]
    pub payload: P2pPayload,
    pub timestamp: DateTime<Utc>,
}

impl P2pEnvelope {
    pub fn now(payload: P2pPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Payload types the requester/provider flows exchange over the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum P2pPayload {
    #[serde(rename_all = "camelCase")]
    GitCredentials {
        git_url: String,
        git_token: String,
        tool: AiTool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        task_description: String,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionComplete {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_summary: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionFailed { task_id: TaskId, error: String },
    #[serde(rename_all = "camelCase")]
    Confirmation {
        accepted: bool,
        credits: f64,
        task_id: TaskId,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmationAck { task_id: TaskId },
    Error { message: String },
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("relay frames are always serializable")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tags_are_snake_case() {
        let frame = RelayMessage::Authenticate {
            token: "jwt".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "authenticate");

        let frame = RelayMessage::NoProvidersAvailable {
            tool: AiTool::Codex,
            model: None,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "no_providers_available");
        assert_eq!(json["tool"], "codex");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn field_keys_are_camel_case() {
        let frame = RelayMessage::TaskMatched {
            task_id: TaskId::new(),
            provider_id: PeerId::new(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert!(json.get("taskId").is_some());
        assert!(json.get("providerId").is_some());
    }

    #[test]
    fn p2p_envelope_round_trips_opaquely() {
        let envelope = P2pEnvelope::now(P2pPayload::GitCredentials {
            git_url: "https://calm-otter-7.tunnel.example/abc.git".into(),
            git_token: "bearer".into(),
            tool: AiTool::Claude,
            model: Some("opus".into()),
            task_description: "fix typo".into(),
        });
        let frame = RelayMessage::P2pRelay {
            from: PeerId::new(),
            to: PeerId::new(),
            payload: envelope,
        };

        let raw = frame.to_json();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["payload"]["type"], "git_credentials");
        assert_eq!(
            value["payload"]["payload"]["gitUrl"],
            "https://calm-otter-7.tunnel.example/abc.git"
        );
        assert!(value["payload"]["timestamp"].is_string());

        match RelayMessage::from_json(&raw).unwrap() {
            RelayMessage::P2pRelay { payload, .. } => match payload.payload {
                P2pPayload::GitCredentials { git_token, .. } => assert_eq!(git_token, "bearer"),
                other => panic!("unexpected payload: {:?}", other),
            },
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(RelayMessage::from_json(r#"{"type":"mystery"}"#).is_err());
    }
}
