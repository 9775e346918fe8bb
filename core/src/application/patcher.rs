// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Result & patch pipeline on the requester side.
//!
//! The provider's commit arrives as one unified diff. Sections creating new
//! files are materialized directly from their added content; the remaining
//! sections go through `git apply --check` before `git apply`. A conflict
//! keeps the saved patch on disk for manual application.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::task::TaskId;

const PATCH_DIR: &str = "patches";

/// What happened to the provider's diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Applied cleanly; the saved patch file was removed.
    Applied,
    /// `git apply --check` refused; the patch is preserved at the given path.
    Conflict(PathBuf),
    /// The user declined auto-apply; the patch is preserved.
    Declined(PathBuf),
}

/// A file the diff creates from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub path: PathBuf,
    pub content: String,
}

/// Persist the diff under `./patches/hokipoki-<taskId>-<ts>.patch`.
pub fn save_patch(task_id: TaskId, diff: &str) -> Result<PathBuf> {
    let dir = PathBuf::from(PATCH_DIR);
    std::fs::create_dir_all(&dir).context("cannot create patches directory")?;
    let path = dir.join(format!(
        "hokipoki-{}-{}.patch",
        task_id,
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    std::fs::write(&path, diff).context("cannot save patch file")?;
    info!(patch = %path.display(), "patch saved");
    Ok(path)
}

/// Apply the diff to the current working tree.
pub async fn apply(task_id: TaskId, diff: &str, auto_apply: bool) -> Result<PatchOutcome> {
    let saved = save_patch(task_id, diff)?;

    if !auto_apply {
        return Ok(PatchOutcome::Declined(saved));
    }

    let (new_files, modifications) = partition_diff(diff);

    for file in &new_files {
        if let Some(parent) = file.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        std::fs::write(&file.path, &file.content)
            .with_context(|| format!("cannot create {}", file.path.display()))?;
        debug!(file = %file.path.display(), "new file materialized");
    }

    if !modifications.trim().is_empty() {
        if !git_apply(&modifications, true).await? {
            return Ok(PatchOutcome::Conflict(saved));
        }
        if !git_apply(&modifications, false).await? {
            // --check passed but apply failed; working tree changed under us.
            return Ok(PatchOutcome::Conflict(saved));
        }
    }

    std::fs::remove_file(&saved).ok();
    info!("patch applied");
    Ok(PatchOutcome::Applied)
}

/// Split a unified diff into new-file creations and everything else.
///
/// A section is a new-file creation when a `new file mode` line follows its
/// `diff --git a/X b/X` header; its content is the accumulated `+` lines.
pub fn partition_diff(diff: &str) -> (Vec<NewFile>, String) {
    let mut new_files = Vec::new();
    let mut modifications = String::new();

    for section in split_sections(diff) {
        match parse_new_file(&section) {
            Some(file) => new_files.push(file),
            None => {
                modifications.push_str(&section);
                if !section.ends_with('\n') {
                    modifications.push('\n');
                }
            }
        }
    }

    (new_files, modifications)
}

/// Chunk a diff into `diff --git` sections, dropping any preamble (e.g. a
/// `git show` commit header).
fn split_sections(diff: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            sections.push(String::new());
        }
        if let Some(current) = sections.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }
    sections
}

fn parse_new_file(section: &str) -> Option<NewFile> {
    let mut lines = section.lines();
    let header = lines.next()?;
    if !header.starts_with("diff --git ") {
        return None;
    }

    // `diff --git a/X b/X` - take the b/ side. The diff comes from the
    // provider, so the path is untrusted: strip `..` and root components
    // before it is ever written to.
    let path = header
        .split_whitespace()
        .last()
        .and_then(|raw| raw.strip_prefix("b/"))
        .and_then(|raw| sanitize_patch_path(Path::new(raw)))?;

    let mut is_new_file = false;
    let mut content = String::new();
    for line in lines {
        if line.starts_with("new file mode") {
            is_new_file = true;
        } else if let Some(added) = line.strip_prefix('+') {
            if !added.starts_with("++") {
                content.push_str(added);
                content.push('\n');
            }
        }
    }

    if is_new_file {
        Some(NewFile { path, content })
    } else {
        None
    }
}

/// Confine an untrusted diff path to the working tree: drop `..`, root and
/// prefix components, `None` when nothing remains.
fn sanitize_patch_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            std::path::Component::Normal(part) => clean.push(part),
            std::path::Component::ParentDir
            | std::path::Component::RootDir
            | std::path::Component::Prefix(_)
            | std::path::Component::CurDir => {}
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Run `git apply [--check]` with the diff on stdin. `Ok(false)` means git
/// refused the patch.
async fn git_apply(diff: &str, check_only: bool) -> Result<bool> {
    let mut args = vec!["apply"];
    if check_only {
        args.push("--check");
    }
    args.push("-");

    let mut child = tokio::process::Command::new("git")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("cannot run git apply - is git installed?")?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    stdin.write_all(diff.as_bytes()).await?;
    stdin.shutdown().await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        debug!(
            "git apply{} refused: {}",
            if check_only { " --check" } else { "" },
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.status.success())
}

/// Tell the user what to do with a preserved patch.
pub fn manual_apply_hint(path: &Path) -> String {
    format!(
        "The patch could not be applied automatically. It was kept at {} - \
         resolve the conflicts and run `git apply {}`.",
        path.display(),
        path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED_DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 111..222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,2 @@
-fn old() {}
+fn new() {}
diff --git a/docs/NOTES.md b/docs/NOTES.md
new file mode 100644
index 000..333
--- /dev/null
+++ b/docs/NOTES.md
@@ -0,0 +2 @@
+# Notes
+Written by the agent.
";

    #[test]
    fn partition_separates_new_files_from_modifications() {
        let (new_files, modifications) = partition_diff(MIXED_DIFF);

        assert_eq!(new_files.len(), 1);
        assert_eq!(new_files[0].path, PathBuf::from("docs/NOTES.md"));
        assert_eq!(new_files[0].content, "# Notes\nWritten by the agent.\n");

        assert!(modifications.contains("a/src/lib.rs"));
        assert!(modifications.contains("+fn new() {}"));
        assert!(!modifications.contains("NOTES.md"));
    }

    #[test]
    fn show_preamble_is_dropped() {
        let diff = format!(
            "commit abc123\nAuthor: HokiPoki\nDate: now\n\n    message\n\n{}",
            MIXED_DIFF
        );
        let (new_files, modifications) = partition_diff(&diff);
        assert_eq!(new_files.len(), 1);
        assert!(!modifications.contains("commit abc123"));
    }

    #[test]
    fn plus_plus_header_lines_are_not_content() {
        let (new_files, _) = partition_diff(MIXED_DIFF);
        assert!(!new_files[0].content.contains("+++"));
        assert!(!new_files[0].content.contains("/dev/null"));
    }

    #[test]
    fn new_file_paths_cannot_escape_the_working_tree() {
        let hostile = "\
diff --git a/x b/../../../.ssh/authorized_keys
new file mode 100644
index 000..333
--- /dev/null
+++ b/../../../.ssh/authorized_keys
@@ -0,0 +1 @@
+ssh-ed25519 AAAA attacker
";
        let (new_files, _) = partition_diff(hostile);
        assert_eq!(new_files.len(), 1);
        // Re-rooted inside the working tree, no parent components survive.
        assert_eq!(new_files[0].path, PathBuf::from(".ssh/authorized_keys"));
        assert!(!new_files[0]
            .path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir)));
    }

    #[test]
    fn sanitize_drops_root_and_parent_components() {
        assert_eq!(
            sanitize_patch_path(Path::new("../../etc/passwd")).unwrap(),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_patch_path(Path::new("/etc/passwd")).unwrap(),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_patch_path(Path::new("src/./lib.rs")).unwrap(),
            PathBuf::from("src/lib.rs")
        );
        assert!(sanitize_patch_path(Path::new("../..")).is_none());
    }

    #[test]
    fn modification_only_diff_creates_nothing() {
        let diff = "\
diff --git a/a.txt b/a.txt
index 1..2 100644
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-helo
+hello
";
        let (new_files, modifications) = partition_diff(diff);
        assert!(new_files.is_empty());
        assert!(modifications.contains("+hello"));
    }
}
