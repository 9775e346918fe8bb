// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::credential::AiTool;

/// Identity assigned to a connected peer by the relay on successful
/// authentication. Lives exactly as long as the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a peer takes within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Provider,
}

/// A provider's registration record as held by the relay.
///
/// Unique per connected peer; destroyed on socket close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub peer_id: PeerId,
    pub tools: Vec<AiTool>,
    pub workspace_ids: Vec<String>,
    pub user_id: String,
}

impl ProviderRecord {
    /// A provider is a matching candidate when it advertises the requested
    /// tool and is a member of the task's workspace.
    pub fn can_serve(&self, tool: AiTool, workspace_id: &str) -> bool {
        self.tools.contains(&tool) && self.workspace_ids.iter().any(|w| w == workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_must_match_tool_and_workspace() {
        let record = ProviderRecord {
            peer_id: PeerId::new(),
            tools: vec![AiTool::Claude, AiTool::Gemini],
            workspace_ids: vec!["ws-1".into(), "ws-2".into()],
            user_id: "user-a".into(),
        };

        assert!(record.can_serve(AiTool::Claude, "ws-1"));
        assert!(record.can_serve(AiTool::Gemini, "ws-2"));
        assert!(!record.can_serve(AiTool::Codex, "ws-1"));
        assert!(!record.can_serve(AiTool::Claude, "ws-3"));
    }
}
