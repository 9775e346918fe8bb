// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The task entity and its status state machine.
//!
//! The relay owns the authoritative task table; peers hold copies. A task is
//! bound to at most one provider once accepted, and a requester may have at
//! most one task outside a terminal state at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::credential::AiTool;
use crate::domain::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle: `pending → offered → (accepted | declined → re-offer)+ →
/// accepted → in_progress → (completed | failed | cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Offered,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Exactly one of completed | failed | cancelled terminates a task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal forward transitions. A declined offer returns the task to
    /// `Pending` for re-offering; both parties may cancel unilaterally from
    /// any non-terminal state.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (_, _) if self.is_terminal() => false,
            (_, Cancelled) => true,
            (Pending, Offered) => true,
            (Pending, Failed) => true,
            (Offered, Accepted) => true,
            (Offered, Pending) => true,
            (Offered, Failed) => true,
            (Accepted, InProgress) => true,
            (Accepted, Failed) => true,
            (InProgress, Completed) => true,
            (InProgress, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Offered => "offered",
            TaskStatus::Accepted => "accepted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub requester_id: PeerId,
    pub tool: AiTool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub description: String,
    pub workspace_id: String,
    pub credits: f64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_summary: Option<String>,
}

impl Task {
    pub fn new(
        requester_id: PeerId,
        tool: AiTool,
        model: Option<String>,
        description: String,
        workspace_id: String,
        credits: f64,
    ) -> Self {
        Self {
            id: TaskId::new(),
            requester_id,
            tool,
            model,
            description,
            workspace_id,
            credits,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            provider_id: None,
            completed_at: None,
            commit_summary: None,
        }
    }

    /// Apply a status transition, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TaskStateError> {
        if !self.status.can_transition(to) {
            return Err(TaskStateError::IllegalTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskStateError {
    #[error("task {task_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            PeerId::new(),
            AiTool::Claude,
            None,
            "fix typo".into(),
            "ws-1".into(),
            2.5,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = task();
        t.transition(TaskStatus::Offered).unwrap();
        t.transition(TaskStatus::Accepted).unwrap();
        t.transition(TaskStatus::InProgress).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.status.is_terminal());
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn decline_returns_to_pending() {
        let mut t = task();
        t.transition(TaskStatus::Offered).unwrap();
        t.transition(TaskStatus::Pending).unwrap();
        t.transition(TaskStatus::Offered).unwrap();
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task();
        t.transition(TaskStatus::Cancelled).unwrap();
        assert!(t.transition(TaskStatus::Offered).is_err());
        assert!(t.transition(TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn cannot_skip_acceptance() {
        let mut t = task();
        assert!(t.transition(TaskStatus::InProgress).is_err());
        assert!(t.transition(TaskStatus::Completed).is_err());
    }

    #[test]
    fn cancel_allowed_from_any_active_state() {
        for setup in [
            vec![],
            vec![TaskStatus::Offered],
            vec![TaskStatus::Offered, TaskStatus::Accepted],
            vec![
                TaskStatus::Offered,
                TaskStatus::Accepted,
                TaskStatus::InProgress,
            ],
        ] {
            let mut t = task();
            for s in setup {
                t.transition(s).unwrap();
            }
            t.transition(TaskStatus::Cancelled).unwrap();
        }
    }
}
