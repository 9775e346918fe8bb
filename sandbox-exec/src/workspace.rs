// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The LUKS-on-loop encrypted workspace.
//!
//! A 100 MiB image file on tmpfs is formatted with a fresh 32-byte key,
//! opened with `--disable-keyring` (the key must never reach the kernel
//! keyring where another process could read it), ext4-formatted and mounted.
//! Teardown unmounts, closes the mapping, overwrites the image with random
//! data, deletes it and zeroes the in-memory key.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const WORKSPACE_DIR: &str = "/workspace";
const IMAGE_PATH: &str = "/workspace/disk.img";
const KEYFILE_PATH: &str = "/workspace/key.bin";
const MOUNT_POINT: &str = "/workspace/code";
const MAPPER_NAME: &str = "workspace";
const MAPPER_DEVICE: &str = "/dev/mapper/workspace";
const IMAGE_MIB: u32 = 100;
const WIPE_CAP: usize = 1024 * 1024;

pub struct EncryptedWorkspace {
    key: Vec<u8>,
    mounted: bool,
    opened: bool,
}

impl EncryptedWorkspace {
    /// Build the encrypted mount, leaving the workspace ready for a clone.
    pub async fn setup() -> Result<Self> {
        // A crashed previous run may have left the mapping open.
        preclean_stale_mapping().await;

        run("dd", &[
            "if=/dev/zero",
            &format!("of={}", IMAGE_PATH),
            "bs=1M",
            &format!("count={}", IMAGE_MIB),
        ])
        .await
        .context("cannot allocate workspace image")?;

        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        std::fs::write(KEYFILE_PATH, &key).context("cannot write keyfile")?;

        let format_result = run("cryptsetup", &[
            "luksFormat",
            "--batch-mode",
            IMAGE_PATH,
            "--key-file",
            KEYFILE_PATH,
        ])
        .await;
        let open_result = match &format_result {
            Ok(_) => {
                run("cryptsetup", &[
                    "luksOpen",
                    "--disable-keyring",
                    "--key-file",
                    KEYFILE_PATH,
                    IMAGE_PATH,
                    MAPPER_NAME,
                ])
                .await
            }
            Err(_) => Err(anyhow::anyhow!("format failed")),
        };

        // The keyfile has served its purpose either way.
        shred_file(KEYFILE_PATH).await;
        format_result.context("luksFormat failed")?;
        open_result.context("luksOpen failed")?;

        let mut workspace = Self {
            key,
            mounted: false,
            opened: true,
        };

        run("mkfs.ext4", &["-F", MAPPER_DEVICE])
            .await
            .context("mkfs.ext4 failed")?;
        std::fs::create_dir_all(MOUNT_POINT)?;
        run("mount", &[MAPPER_DEVICE, MOUNT_POINT])
            .await
            .context("cannot mount encrypted workspace")?;
        workspace.mounted = true;

        info!("encrypted workspace mounted at {}", MOUNT_POINT);
        Ok(workspace)
    }

    pub fn mount_point(&self) -> &Path {
        Path::new(MOUNT_POINT)
    }

    /// Unmount, close, destroy the image and zero the key. Idempotent and
    /// best-effort: every step runs regardless of earlier failures.
    pub async fn teardown(&mut self) {
        if self.mounted {
            if let Err(e) = run("umount", &[MOUNT_POINT]).await {
                warn!("umount failed: {}", e);
            }
            self.mounted = false;
        }
        if self.opened {
            if let Err(e) = run("cryptsetup", &["luksClose", MAPPER_NAME]).await {
                warn!("luksClose failed: {}", e);
            }
            self.opened = false;
        }

        if Path::new(IMAGE_PATH).exists() {
            if let Err(e) = run("dd", &[
                "if=/dev/urandom",
                &format!("of={}", IMAGE_PATH),
                "bs=1M",
                &format!("count={}", IMAGE_MIB),
                "conv=notrunc",
            ])
            .await
            {
                warn!("image overwrite failed: {}", e);
            }
            let _ = std::fs::remove_file(IMAGE_PATH);
        }

        self.key.iter_mut().for_each(|b| *b = 0);
        debug!("workspace key zeroed, image destroyed");
    }
}

async fn preclean_stale_mapping() {
    if run("cryptsetup", &["status", MAPPER_NAME]).await.is_ok() {
        warn!("stale {} mapping found, closing", MAPPER_NAME);
        let _ = run("umount", &[MOUNT_POINT]).await;
        let _ = run("cryptsetup", &["luksClose", MAPPER_NAME]).await;
    }
}

/// Overwrite everything under `/workspace` and `/tmp` with random bytes.
/// Called when any step fails: whatever plaintext got written must not
/// survive the container.
pub fn emergency_wipe(home: &Path) {
    warn!("emergency wipe engaged");
    for root in [
        PathBuf::from(WORKSPACE_DIR),
        PathBuf::from("/tmp"),
        home.join(".gitconfig"),
        home.join(".git-credential-helper.sh"),
    ] {
        wipe_path(&root);
    }
}

fn wipe_path(root: &Path) {
    if root.is_file() {
        overwrite_file(root);
        return;
    }
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            overwrite_file(entry.path());
        }
    }
}

fn overwrite_file(path: &Path) {
    let len = std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0);
    let mut noise = vec![0u8; len.min(WIPE_CAP)];
    OsRng.fill_bytes(&mut noise);
    if std::fs::write(path, &noise).is_err() {
        debug!("could not overwrite {}", path.display());
    }
}

async fn shred_file(path: &str) {
    if run("shred", &["-u", path]).await.is_err() {
        // shred may be missing; fall back to overwrite + unlink.
        overwrite_file(Path::new(path));
        let _ = std::fs::remove_file(path);
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("cannot run {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
