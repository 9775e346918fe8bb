// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod patcher;
pub mod provider;
pub mod requester;

/// Read a yes/no answer from stdin; anything but an explicit "n" is a yes.
pub(crate) async fn prompt_yes_no(question: &str) -> bool {
    use std::io::Write;
    use tokio::io::{AsyncBufReadExt, BufReader};

    print!("{}", question);
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    if reader.read_line(&mut line).await.is_err() {
        return true;
    }
    !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no")
}
