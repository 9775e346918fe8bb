// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Candidate selection for task matching.
//!
//! Providers are tried in round-robin order by the time they were last
//! offered any task, so load spreads across an idle pool. A provider is a
//! candidate when it advertises the task's tool, belongs to the task's
//! workspace, is not serving another active task and has not declined this
//! task.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use hokipoki_core::domain::credential::AiTool;
use hokipoki_core::domain::peer::{PeerId, ProviderRecord};

pub struct Candidate<'a> {
    pub peer_id: PeerId,
    pub record: &'a ProviderRecord,
    pub last_offered: Option<DateTime<Utc>>,
    pub busy: bool,
}

/// Pick the next provider to offer the task to, or `None` when the candidate
/// set is exhausted.
pub fn select_candidate<'a>(
    candidates: impl Iterator<Item = Candidate<'a>>,
    tool: AiTool,
    workspace_id: &str,
    declined: &HashSet<PeerId>,
) -> Option<PeerId> {
    candidates
        .filter(|c| !c.busy)
        .filter(|c| !declined.contains(&c.peer_id))
        .filter(|c| c.record.can_serve(tool, workspace_id))
        // Never-offered providers first, then the least recently offered.
        .min_by_key(|c| c.last_offered)
        .map(|c| c.peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(peer_id: PeerId, tools: &[AiTool], workspaces: &[&str]) -> ProviderRecord {
        ProviderRecord {
            peer_id,
            tools: tools.to_vec(),
            workspace_ids: workspaces.iter().map(|w| w.to_string()).collect(),
            user_id: "u".into(),
        }
    }

    #[test]
    fn workspace_and_tool_filter() {
        let a = PeerId::new();
        let b = PeerId::new();
        let records = vec![
            (a, record(a, &[AiTool::Claude], &["ws-1"])),
            (b, record(b, &[AiTool::Codex], &["ws-2"])),
        ];

        let pick = |tool, ws: &str| {
            select_candidate(
                records.iter().map(|(id, r)| Candidate {
                    peer_id: *id,
                    record: r,
                    last_offered: None,
                    busy: false,
                }),
                tool,
                ws,
                &HashSet::new(),
            )
        };

        assert_eq!(pick(AiTool::Claude, "ws-1"), Some(a));
        assert_eq!(pick(AiTool::Codex, "ws-2"), Some(b));
        // A provider is never offered a task outside its workspaces.
        assert_eq!(pick(AiTool::Claude, "ws-2"), None);
        assert_eq!(pick(AiTool::Gemini, "ws-1"), None);
    }

    #[test]
    fn round_robin_by_last_offered() {
        let now = Utc::now();
        let fresh = PeerId::new();
        let stale = PeerId::new();
        let never = PeerId::new();
        let records = vec![
            (fresh, record(fresh, &[AiTool::Claude], &["ws"]), Some(now)),
            (
                stale,
                record(stale, &[AiTool::Claude], &["ws"]),
                Some(now - Duration::minutes(10)),
            ),
            (never, record(never, &[AiTool::Claude], &["ws"]), None),
        ];

        let pick = |declined: &HashSet<PeerId>| {
            select_candidate(
                records.iter().map(|(id, r, at)| Candidate {
                    peer_id: *id,
                    record: r,
                    last_offered: *at,
                    busy: false,
                }),
                AiTool::Claude,
                "ws",
                declined,
            )
        };

        // Never-offered wins, then least-recently-offered.
        assert_eq!(pick(&HashSet::new()), Some(never));
        let mut declined = HashSet::new();
        declined.insert(never);
        assert_eq!(pick(&declined), Some(stale));
        declined.insert(stale);
        assert_eq!(pick(&declined), Some(fresh));
        declined.insert(fresh);
        assert_eq!(pick(&declined), None);
    }

    #[test]
    fn busy_providers_are_skipped() {
        let only = PeerId::new();
        let records = vec![(only, record(only, &[AiTool::Claude], &["ws"]))];

        let pick = |busy| {
            select_candidate(
                records.iter().map(|(id, r)| Candidate {
                    peer_id: *id,
                    record: r,
                    last_offered: None,
                    busy,
                }),
                AiTool::Claude,
                "ws",
                &HashSet::new(),
            )
        };

        assert_eq!(pick(true), None);
        assert_eq!(pick(false), Some(only));
    }
}
