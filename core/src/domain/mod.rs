// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod credential;
pub mod message;
pub mod peer;
pub mod settings;
pub mod task;
