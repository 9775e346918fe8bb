// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # HokiPoki Core
//!
//! Domain model and subsystem infrastructure for the HokiPoki peer-to-peer
//! task marketplace: a requester's coding task runs on a provider's machine
//! inside an encrypted sandbox, with code moved through an ephemeral,
//! tunnel-exposed git server and control messages relayed by a central
//! matchmaking relay.
//!
//! ## Layers
//!
//! - [`domain`] - entities, the relay wire protocol and the task state machine
//! - [`application`] - the requester and provider orchestration flows
//! - [`infrastructure`] - vault, identity, tool credentials, tunnel, git
//!   server, sandbox, relay client and backend API

pub mod application;
pub mod domain;
pub mod infrastructure;
