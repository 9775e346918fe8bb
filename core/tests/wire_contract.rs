// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Wire-contract tests: frames exactly as a foreign client would write them
//! must parse, and our frames must carry the agreed `type` tags and
//! camelCase keys.

use hokipoki_core::domain::credential::AiTool;
use hokipoki_core::domain::message::{P2pPayload, RelayMessage};
use hokipoki_core::domain::task::TaskStatus;

#[test]
fn authenticate_frame_from_literal_json() {
    let frame = RelayMessage::from_json(r#"{"type":"authenticate","token":"eyJhbGc..."}"#).unwrap();
    match frame {
        RelayMessage::Authenticate { token } => assert_eq!(token, "eyJhbGc..."),
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn register_provider_frame_from_literal_json() {
    let raw = r#"{
        "type": "register_provider",
        "payload": {
            "tools": ["claude", "gemini"],
            "workspaceIds": ["ws-1", "ws-2"],
            "userId": "kc-user-1",
            "token": "jwt"
        }
    }"#;
    match RelayMessage::from_json(raw).unwrap() {
        RelayMessage::RegisterProvider { payload } => {
            assert_eq!(payload.tools, vec![AiTool::Claude, AiTool::Gemini]);
            assert_eq!(payload.workspace_ids, vec!["ws-1", "ws-2"]);
            assert_eq!(payload.user_id, "kc-user-1");
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn publish_task_frame_from_literal_json() {
    let raw = r#"{
        "type": "publish_task",
        "payload": {
            "tool": "codex",
            "task": "Fix typo",
            "description": "Fix typo",
            "estimatedDuration": 600,
            "credits": 2.5,
            "workspaceId": "ws-1"
        }
    }"#;
    match RelayMessage::from_json(raw).unwrap() {
        RelayMessage::PublishTask { payload } => {
            assert_eq!(payload.tool, AiTool::Codex);
            assert_eq!(payload.credits, 2.5);
            assert!(payload.model.is_none());
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn git_credentials_envelope_from_literal_json() {
    let raw = r#"{
        "type": "p2p_relay",
        "from": "3e7e64d0-95a6-4f8d-9f2b-0d8b8f0b2d11",
        "to": "6d1f9f34-1111-4cde-8d4e-222222222222",
        "payload": {
            "type": "git_credentials",
            "payload": {
                "gitUrl": "http://calm-otter-7.tunnel.hoki-poki.ai:8080/abc.git",
                "gitToken": "one-time-bearer",
                "tool": "claude",
                "taskDescription": "Fix typo"
            },
            "timestamp": "2026-08-01T12:00:00Z"
        }
    }"#;
    match RelayMessage::from_json(raw).unwrap() {
        RelayMessage::P2pRelay { payload, .. } => match payload.payload {
            P2pPayload::GitCredentials {
                git_url, git_token, tool, model, ..
            } => {
                assert!(git_url.ends_with("/abc.git"));
                assert_eq!(git_token, "one-time-bearer");
                assert_eq!(tool, AiTool::Claude);
                assert!(model.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        },
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn confirmation_pair_round_trips() {
    let raw = r#"{
        "type": "p2p_relay",
        "from": "3e7e64d0-95a6-4f8d-9f2b-0d8b8f0b2d11",
        "to": "6d1f9f34-1111-4cde-8d4e-222222222222",
        "payload": {
            "type": "confirmation",
            "payload": { "accepted": true, "credits": 2.5, "taskId": "9a6e64d0-95a6-4f8d-9f2b-0d8b8f0b2d99" },
            "timestamp": "2026-08-01T12:00:05Z"
        }
    }"#;
    match RelayMessage::from_json(raw).unwrap() {
        RelayMessage::P2pRelay { payload, .. } => match payload.payload {
            P2pPayload::Confirmation {
                accepted, credits, ..
            } => {
                assert!(accepted);
                assert_eq!(credits, 2.5);
            }
            other => panic!("unexpected payload: {:?}", other),
        },
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn task_status_wire_values() {
    for (status, expected) in [
        (TaskStatus::Pending, "\"pending\""),
        (TaskStatus::InProgress, "\"in_progress\""),
        (TaskStatus::Completed, "\"completed\""),
        (TaskStatus::Failed, "\"failed\""),
        (TaskStatus::Cancelled, "\"cancelled\""),
    ] {
        assert_eq!(serde_json::to_string(&status).unwrap(), expected);
    }
}

#[test]
fn cancel_task_frame_round_trips() {
    let frame = RelayMessage::from_json(
        r#"{"type":"cancel_task","taskId":"9a6e64d0-95a6-4f8d-9f2b-0d8b8f0b2d99","reason":"interrupted"}"#,
    )
    .unwrap();
    match frame {
        RelayMessage::CancelTask { reason, .. } => {
            assert_eq!(reason.as_deref(), Some("interrupted"));
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}
