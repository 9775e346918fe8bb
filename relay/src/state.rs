// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Authoritative relay state: connected peers, the provider pool and the
//! task table. All mutation happens through this module under one lock;
//! sessions only dispatch frames into it.
//!
//! The table is in-memory by design: matching order depends on live
//! connection state, so nothing here survives a relay restart.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hokipoki_core::domain::message::{
    P2pEnvelope, P2pPayload, ProviderRegistration, PublishTask, RelayMessage,
    RequesterRegistration,
};
use hokipoki_core::domain::peer::{PeerId, ProviderRecord, Role};
use hokipoki_core::domain::task::{Task, TaskId, TaskStatus};

use crate::matching::{select_candidate, Candidate};

pub struct PeerHandle {
    tx: mpsc::UnboundedSender<RelayMessage>,
    pub user_id: String,
    pub role: Option<Role>,
}

struct ProviderEntry {
    record: ProviderRecord,
    last_offered: Option<DateTime<Utc>>,
    active_task: Option<TaskId>,
}

struct TaskEntry {
    task: Task,
    declined: HashSet<PeerId>,
    offered_to: Option<PeerId>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, PeerHandle>,
    providers: HashMap<PeerId, ProviderEntry>,
    tasks: HashMap<TaskId, TaskEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub peers: usize,
    pub providers: usize,
    pub active_tasks: usize,
}

pub struct RelayState {
    inner: Mutex<Inner>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn stats(&self) -> RelayStats {
        let inner = self.inner.lock().expect("relay state poisoned");
        RelayStats {
            peers: inner.peers.len(),
            providers: inner.providers.len(),
            active_tasks: inner.tasks.values().filter(|t| t.task.is_active()).count(),
        }
    }

    /// Install an authenticated peer and confirm the connection.
    pub fn register_peer(
        &self,
        peer_id: PeerId,
        user_id: String,
        tx: mpsc::UnboundedSender<RelayMessage>,
    ) {
        let mut inner = self.inner.lock().expect("relay state poisoned");
        inner.peers.insert(
            peer_id,
            PeerHandle {
                tx,
                user_id,
                role: None,
            },
        );
        inner.send(peer_id, RelayMessage::ConnectionConfirmed { peer_id });
        info!(peer = %peer_id, "peer connected");
    }

    pub fn set_requester(&self, peer_id: PeerId, registration: RequesterRegistration) {
        let mut inner = self.inner.lock().expect("relay state poisoned");
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.role = Some(Role::Requester);
            debug!(peer = %peer_id, workspace = %registration.workspace_id, "requester registered");
        }
    }

    pub fn set_provider(&self, peer_id: PeerId, registration: ProviderRegistration) {
        let mut inner = self.inner.lock().expect("relay state poisoned");
        let Some(peer) = inner.peers.get_mut(&peer_id) else {
            return;
        };
        peer.role = Some(Role::Provider);
        inner.providers.insert(
            peer_id,
            ProviderEntry {
                record: ProviderRecord {
                    peer_id,
                    tools: registration.tools.clone(),
                    workspace_ids: registration.workspace_ids.clone(),
                    user_id: registration.user_id.clone(),
                },
                last_offered: None,
                active_task: None,
            },
        );
        info!(peer = %peer_id, tools = ?registration.tools, "provider registered");
    }

    /// Create the task, acknowledge it and start matching.
    pub fn publish_task(&self, peer_id: PeerId, payload: PublishTask) {
        let mut inner = self.inner.lock().expect("relay state poisoned");

        let Some(peer) = inner.peers.get(&peer_id) else {
            return;
        };
        if peer.role != Some(Role::Requester) {
            inner.send(
                peer_id,
                RelayMessage::Error {
                    message: "register as a requester before publishing".into(),
                },
            );
            return;
        }

        let task = Task::new(
            peer_id,
            payload.tool,
            payload.model,
            payload.task,
            payload.workspace_id,
            payload.credits,
        );
        let task_id = task.id;
        inner.tasks.insert(
            task_id,
            TaskEntry {
                task,
                declined: HashSet::new(),
                offered_to: None,
            },
        );
        inner.send(peer_id, RelayMessage::TaskPublished { task_id });
        info!(task = %task_id, requester = %peer_id, "task published");

        inner.offer_next(task_id);
    }

    pub fn accept_task(&self, provider_id: PeerId, task_id: TaskId) {
        let mut inner = self.inner.lock().expect("relay state poisoned");

        let Some(entry) = inner.tasks.get_mut(&task_id) else {
            return;
        };
        if entry.offered_to != Some(provider_id) {
            warn!(task = %task_id, peer = %provider_id, "accept from a peer the task was not offered to");
            return;
        }
        if entry.task.transition(TaskStatus::Accepted).is_err() {
            return;
        }
        entry.task.provider_id = Some(provider_id);
        let requester_id = entry.task.requester_id;

        if let Some(provider) = inner.providers.get_mut(&provider_id) {
            provider.active_task = Some(task_id);
        }

        inner.send(
            requester_id,
            RelayMessage::TaskMatched {
                task_id,
                provider_id,
            },
        );
        inner.send(
            provider_id,
            RelayMessage::TaskAccepted {
                task_id,
                requester_id,
            },
        );
        info!(task = %task_id, provider = %provider_id, "task matched");
    }

    /// An explicit decline removes the provider from this task's candidate
    /// set and moves on.
    pub fn decline_task(&self, provider_id: PeerId, task_id: TaskId) {
        let mut inner = self.inner.lock().expect("relay state poisoned");

        let Some(entry) = inner.tasks.get_mut(&task_id) else {
            return;
        };
        if entry.offered_to != Some(provider_id) {
            return;
        }
        entry.declined.insert(provider_id);
        entry.offered_to = None;
        let _ = entry.task.transition(TaskStatus::Pending);
        debug!(task = %task_id, provider = %provider_id, "offer declined");

        inner.offer_next(task_id);
    }

    /// Forward a P2P envelope verbatim when the peers are matched on an
    /// active task. The envelope's payload stays opaque to routing; known
    /// lifecycle types additionally advance the task table so providers
    /// free up for the next offer.
    pub fn forward_p2p(&self, from: PeerId, to: PeerId, envelope: P2pEnvelope) {
        let mut inner = self.inner.lock().expect("relay state poisoned");

        let matched = inner.tasks.iter().find_map(|(id, entry)| {
            let pair = (entry.task.requester_id == from && entry.task.provider_id == Some(to))
                || (entry.task.requester_id == to && entry.task.provider_id == Some(from));
            (entry.task.is_active() && pair).then_some(*id)
        });
        let Some(matched_task) = matched else {
            warn!(from = %from, to = %to, "dropping p2p frame between unmatched peers");
            inner.send(
                from,
                RelayMessage::Error {
                    message: "p2p relay requires an active matched task".into(),
                },
            );
            return;
        };

        inner.bookkeep_lifecycle(matched_task, &envelope.payload);
        inner.send(
            to,
            RelayMessage::P2pRelay {
                from,
                to,
                payload: envelope,
            },
        );
    }

    /// The single cancellation transition: explicit `cancel_task` frames and
    /// socket closes both land here, so the counterpart always sees exactly
    /// one `task_cancelled`.
    pub fn cancel_task(&self, initiator: PeerId, task_id: TaskId, reason: Option<String>) {
        let mut inner = self.inner.lock().expect("relay state poisoned");
        inner.cancel_task(initiator, task_id, reason);
    }

    /// Tear down everything a disconnected peer owned.
    pub fn remove_peer(&self, peer_id: PeerId) {
        let mut inner = self.inner.lock().expect("relay state poisoned");
        inner.peers.remove(&peer_id);
        inner.providers.remove(&peer_id);

        // Offers pending at this provider go back into matching; active
        // tasks involving the peer are cancelled toward the counterpart.
        let involved: Vec<TaskId> = inner
            .tasks
            .iter()
            .filter(|(_, entry)| entry.task.is_active())
            .filter(|(_, entry)| {
                entry.task.requester_id == peer_id
                    || entry.task.provider_id == Some(peer_id)
                    || entry.offered_to == Some(peer_id)
            })
            .map(|(id, _)| *id)
            .collect();

        for task_id in involved {
            let entry = inner.tasks.get_mut(&task_id).expect("task present");
            if entry.offered_to == Some(peer_id) && entry.task.provider_id.is_none() {
                entry.declined.insert(peer_id);
                entry.offered_to = None;
                let _ = entry.task.transition(TaskStatus::Pending);
                inner.offer_next(task_id);
            } else {
                inner.cancel_task(peer_id, task_id, Some("peer disconnected".into()));
            }
        }
        info!(peer = %peer_id, "peer disconnected");
    }
}

impl Inner {
    fn send(&self, to: PeerId, message: RelayMessage) {
        if let Some(peer) = self.peers.get(&to) {
            if peer.tx.send(message).is_err() {
                debug!(peer = %to, "send to closing peer dropped");
            }
        }
    }

    /// Offer the task to the next candidate, or fail it when none remain.
    fn offer_next(&mut self, task_id: TaskId) {
        let Some(entry) = self.tasks.get(&task_id) else {
            return;
        };
        let tool = entry.task.tool;
        let workspace_id = entry.task.workspace_id.clone();
        let declined = entry.declined.clone();
        let requester_id = entry.task.requester_id;
        let model = entry.task.model.clone();

        let candidate = select_candidate(
            self.providers.iter().map(|(id, p)| Candidate {
                peer_id: *id,
                record: &p.record,
                last_offered: p.last_offered,
                busy: p.active_task.is_some(),
            }),
            tool,
            &workspace_id,
            &declined,
        );

        match candidate {
            Some(provider_id) => {
                let entry = self.tasks.get_mut(&task_id).expect("task present");
                entry.offered_to = Some(provider_id);
                let _ = entry.task.transition(TaskStatus::Offered);
                let task = entry.task.clone();
                if let Some(provider) = self.providers.get_mut(&provider_id) {
                    provider.last_offered = Some(Utc::now());
                }
                self.send(provider_id, RelayMessage::NewTask { task });
                debug!(task = %task_id, provider = %provider_id, "task offered");
            }
            None => {
                let entry = self.tasks.get_mut(&task_id).expect("task present");
                let _ = entry.task.transition(TaskStatus::Failed);
                info!(task = %task_id, "no providers available");
                self.send(
                    requester_id,
                    RelayMessage::NoProvidersAvailable { tool, model },
                );
            }
        }
    }

    fn cancel_task(&mut self, initiator: PeerId, task_id: TaskId, reason: Option<String>) {
        let Some(entry) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if entry.task.status.is_terminal() {
            return;
        }
        let _ = entry.task.transition(TaskStatus::Cancelled);

        let requester_id = entry.task.requester_id;
        let provider_id = entry.task.provider_id.or(entry.offered_to);
        let counterpart = if initiator == requester_id {
            provider_id
        } else {
            Some(requester_id)
        };

        self.release_provider(task_id);
        if let Some(counterpart) = counterpart {
            self.send(
                counterpart,
                RelayMessage::TaskCancelled { task_id, reason },
            );
        }
        info!(task = %task_id, by = %initiator, "task cancelled");
    }

    /// Advance the task table for the lifecycle payloads the flows exchange.
    /// Unknown payload types pass through untouched.
    fn bookkeep_lifecycle(&mut self, matched_task: TaskId, payload: &P2pPayload) {
        match payload {
            P2pPayload::GitCredentials { .. } => {
                // First credential handoff marks the work as started.
                if let Some(entry) = self.tasks.get_mut(&matched_task) {
                    if entry.task.status == TaskStatus::Accepted {
                        let _ = entry.task.transition(TaskStatus::InProgress);
                    }
                }
            }
            // Execution completion alone is not terminal: the task stays
            // active until the confirmation exchange so those frames still
            // route between the pair.
            P2pPayload::ExecutionComplete { task_id, .. } => {
                if let Some(entry) = self.tasks.get_mut(task_id) {
                    if entry.task.status == TaskStatus::Accepted {
                        let _ = entry.task.transition(TaskStatus::InProgress);
                    }
                }
            }
            P2pPayload::ConfirmationAck { task_id } => {
                if let Some(entry) = self.tasks.get_mut(task_id) {
                    let _ = entry.task.transition(TaskStatus::Completed);
                }
                self.release_provider(*task_id);
            }
            P2pPayload::ExecutionFailed { task_id, .. } => {
                if let Some(entry) = self.tasks.get_mut(task_id) {
                    let _ = entry.task.transition(TaskStatus::Failed);
                }
                self.release_provider(*task_id);
            }
            _ => {}
        }
    }

    fn release_provider(&mut self, task_id: TaskId) {
        for provider in self.providers.values_mut() {
            if provider.active_task == Some(task_id) {
                provider.active_task = None;
            }
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hokipoki_core::domain::credential::AiTool;

    fn connect(state: &RelayState) -> (PeerId, mpsc::UnboundedReceiver<RelayMessage>) {
        let peer_id = PeerId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_peer(peer_id, format!("user-{}", peer_id), tx);
        // Drain the connection_confirmed frame.
        match rx.try_recv() {
            Ok(RelayMessage::ConnectionConfirmed { .. }) => {}
            other => panic!("expected connection_confirmed, got {:?}", other),
        }
        (peer_id, rx)
    }

    fn connect_requester(
        state: &RelayState,
        workspace: &str,
    ) -> (PeerId, mpsc::UnboundedReceiver<RelayMessage>) {
        let (peer_id, rx) = connect(state);
        state.set_requester(
            peer_id,
            RequesterRegistration {
                workspace_id: workspace.into(),
                user_id: "requester".into(),
            },
        );
        (peer_id, rx)
    }

    fn connect_provider(
        state: &RelayState,
        tools: &[AiTool],
        workspaces: &[&str],
    ) -> (PeerId, mpsc::UnboundedReceiver<RelayMessage>) {
        let (peer_id, rx) = connect(state);
        state.set_provider(
            peer_id,
            ProviderRegistration {
                tools: tools.to_vec(),
                workspace_ids: workspaces.iter().map(|w| w.to_string()).collect(),
                user_id: "provider".into(),
                token: "jwt".into(),
            },
        );
        (peer_id, rx)
    }

    fn publish(state: &RelayState, requester: PeerId, tool: AiTool, workspace: &str) {
        state.publish_task(
            requester,
            PublishTask {
                tool,
                model: None,
                task: "fix typo".into(),
                description: "fix typo".into(),
                estimated_duration: 600,
                credits: 2.5,
                workspace_id: workspace.into(),
            },
        );
    }

    fn expect_task_id(rx: &mut mpsc::UnboundedReceiver<RelayMessage>) -> TaskId {
        match rx.try_recv() {
            Ok(RelayMessage::TaskPublished { task_id }) => task_id,
            other => panic!("expected task_published, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn happy_path_match() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);

        let offered = match prov_rx.try_recv() {
            Ok(RelayMessage::NewTask { task }) => task,
            other => panic!("expected new_task, got {:?}", other),
        };
        assert_eq!(offered.id, task_id);
        assert_eq!(offered.status, TaskStatus::Offered);

        state.accept_task(provider, task_id);
        assert!(matches!(
            req_rx.try_recv(),
            Ok(RelayMessage::TaskMatched { provider_id, .. }) if provider_id == provider
        ));
        assert!(matches!(
            prov_rx.try_recv(),
            Ok(RelayMessage::TaskAccepted { requester_id, .. }) if requester_id == requester
        ));
    }

    #[tokio::test]
    async fn no_providers_for_tool() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (_provider, _prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Codex, "ws");
        let _ = expect_task_id(&mut req_rx);
        assert!(matches!(
            req_rx.try_recv(),
            Ok(RelayMessage::NoProvidersAvailable { tool: AiTool::Codex, .. })
        ));
    }

    #[tokio::test]
    async fn workspace_mismatch_is_never_offered() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws-a");
        let (_provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws-b"]);

        publish(&state, requester, AiTool::Claude, "ws-a");
        let _ = expect_task_id(&mut req_rx);
        assert!(matches!(
            req_rx.try_recv(),
            Ok(RelayMessage::NoProvidersAvailable { .. })
        ));
        assert!(prov_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn decline_cascade_fails_task() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let mut providers = Vec::new();
        for _ in 0..3 {
            providers.push(connect_provider(&state, &[AiTool::Claude], &["ws"]));
        }

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);

        // Each provider receives the offer in turn and declines.
        for _ in 0..3 {
            let mut offered_at = None;
            for (peer_id, rx) in providers.iter_mut() {
                if let Ok(RelayMessage::NewTask { task }) = rx.try_recv() {
                    assert_eq!(task.id, task_id);
                    offered_at = Some(*peer_id);
                }
            }
            let provider = offered_at.expect("someone must have been offered");
            state.decline_task(provider, task_id);
        }

        assert!(matches!(
            req_rx.try_recv(),
            Ok(RelayMessage::NoProvidersAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn busy_provider_not_offered_second_task() {
        let state = RelayState::new();
        let (requester_a, mut rx_a) = connect_requester(&state, "ws");
        let (requester_b, mut rx_b) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester_a, AiTool::Claude, "ws");
        let first = expect_task_id(&mut rx_a);
        assert!(matches!(prov_rx.try_recv(), Ok(RelayMessage::NewTask { .. })));
        state.accept_task(provider, first);
        let _ = rx_a.try_recv(); // task_matched
        let _ = prov_rx.try_recv(); // task_accepted

        // The only provider is busy: the second task cannot match.
        publish(&state, requester_b, AiTool::Claude, "ws");
        let _ = expect_task_id(&mut rx_b);
        assert!(matches!(
            rx_b.try_recv(),
            Ok(RelayMessage::NoProvidersAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn p2p_forwarding_requires_a_match() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);
        let (stranger, mut stranger_rx) = connect_requester(&state, "ws");

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);
        let _ = prov_rx.try_recv();
        state.accept_task(provider, task_id);
        let _ = req_rx.try_recv();
        let _ = prov_rx.try_recv();

        let envelope = P2pEnvelope::now(P2pPayload::GitCredentials {
            git_url: "http://x/y.git".into(),
            git_token: "t".into(),
            tool: AiTool::Claude,
            model: None,
            task_description: "d".into(),
        });

        // Matched pair: forwarded.
        state.forward_p2p(requester, provider, envelope.clone());
        assert!(matches!(
            prov_rx.try_recv(),
            Ok(RelayMessage::P2pRelay { .. })
        ));

        // Unmatched peer: dropped with an error back to the sender.
        state.forward_p2p(stranger, provider, envelope);
        assert!(matches!(
            stranger_rx.try_recv(),
            Ok(RelayMessage::Error { .. })
        ));
    }

    #[tokio::test]
    async fn confirmation_ack_completes_and_frees_the_provider() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (requester_b, mut rx_b) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);
        let _ = prov_rx.try_recv();
        state.accept_task(provider, task_id);
        let _ = req_rx.try_recv();
        let _ = prov_rx.try_recv();

        state.forward_p2p(
            provider,
            requester,
            P2pEnvelope::now(P2pPayload::ExecutionComplete {
                task_id,
                commit_summary: Some("HokiPoki claude: done".into()),
            }),
        );
        assert!(matches!(req_rx.try_recv(), Ok(RelayMessage::P2pRelay { .. })));

        // The confirmation pair still routes: the task is not yet terminal.
        state.forward_p2p(
            requester,
            provider,
            P2pEnvelope::now(P2pPayload::Confirmation {
                accepted: true,
                credits: 2.5,
                task_id,
            }),
        );
        assert!(matches!(prov_rx.try_recv(), Ok(RelayMessage::P2pRelay { .. })));
        state.forward_p2p(
            provider,
            requester,
            P2pEnvelope::now(P2pPayload::ConfirmationAck { task_id }),
        );
        assert!(matches!(req_rx.try_recv(), Ok(RelayMessage::P2pRelay { .. })));

        // Only after the ack can the provider take another task.
        publish(&state, requester_b, AiTool::Claude, "ws");
        let _ = expect_task_id(&mut rx_b);
        assert!(matches!(prov_rx.try_recv(), Ok(RelayMessage::NewTask { .. })));
    }

    #[tokio::test]
    async fn cancel_notifies_the_counterpart_once() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);
        let _ = prov_rx.try_recv();
        state.accept_task(provider, task_id);
        let _ = req_rx.try_recv();
        let _ = prov_rx.try_recv();

        state.cancel_task(requester, task_id, Some("interrupted".into()));
        assert!(matches!(
            prov_rx.try_recv(),
            Ok(RelayMessage::TaskCancelled { .. })
        ));

        // A second cancel (e.g. the subsequent socket close) is a no-op.
        state.cancel_task(requester, task_id, None);
        assert!(prov_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requester_disconnect_cancels_toward_provider() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (provider, mut prov_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);
        let _ = prov_rx.try_recv();
        state.accept_task(provider, task_id);
        let _ = req_rx.try_recv();
        let _ = prov_rx.try_recv();

        state.remove_peer(requester);
        assert!(matches!(
            prov_rx.try_recv(),
            Ok(RelayMessage::TaskCancelled { .. })
        ));
    }

    #[tokio::test]
    async fn offered_provider_disconnect_reoffers() {
        let state = RelayState::new();
        let (requester, mut req_rx) = connect_requester(&state, "ws");
        let (first, mut first_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);
        let (_second, mut second_rx) = connect_provider(&state, &[AiTool::Claude], &["ws"]);

        publish(&state, requester, AiTool::Claude, "ws");
        let task_id = expect_task_id(&mut req_rx);

        // Whichever got the offer disconnects; the other must receive it.
        let first_got_it = matches!(first_rx.try_recv(), Ok(RelayMessage::NewTask { .. }));
        if first_got_it {
            state.remove_peer(first);
            assert!(matches!(
                second_rx.try_recv(),
                Ok(RelayMessage::NewTask { task }) if task.id == task_id
            ));
        } else {
            assert!(matches!(
                second_rx.try_recv(),
                Ok(RelayMessage::NewTask { .. })
            ));
        }
    }
}
