// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Token Vault: AES-256-GCM sealed blobs on disk.
//!
//! Envelope layout is `iv(12B) ‖ tag(16B) ‖ ciphertext`, written as a single
//! binary file with owner-only permissions. The symmetric key is a 32-byte
//! random value created lazily at `~/.hokipoki/key.secret`. There is no key
//! rotation; callers treat the vault as opaque.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("envelope failed integrity verification")]
    IntegrityFailure,
    #[error("envelope is malformed (too short)")]
    Malformed,
    #[error("vault i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A sealed envelope as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, VaultError> {
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(VaultError::Malformed);
        }
        let mut iv = [0u8; IV_LEN];
        let mut tag = [0u8; TAG_LEN];
        iv.copy_from_slice(&raw[..IV_LEN]);
        tag.copy_from_slice(&raw[IV_LEN..IV_LEN + TAG_LEN]);
        Ok(Self {
            iv,
            tag,
            ciphertext: raw[IV_LEN + TAG_LEN..].to_vec(),
        })
    }
}

pub struct Vault {
    key_path: PathBuf,
    store_dir: PathBuf,
}

impl Vault {
    /// Vault rooted at the standard `~/.hokipoki` directory.
    pub fn open_default() -> Result<Self, VaultError> {
        let dir = super::paths::ensure_base_dir()
            .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;
        Ok(Self {
            key_path: super::paths::key_file(),
            store_dir: dir,
        })
    }

    /// Vault rooted at an arbitrary directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            key_path: dir.join("key.secret"),
            store_dir: dir,
        }
    }

    /// Encrypt a blob into an envelope with a fresh random IV.
    pub fn seal(&self, blob: &[u8]) -> Result<Envelope, VaultError> {
        let cipher = self.cipher()?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        // aes-gcm appends the tag to the ciphertext; the envelope keeps it
        // separate so the on-disk layout is iv || tag || ct.
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), blob)
            .map_err(|_| VaultError::IntegrityFailure)?;
        let split = sealed.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[split..]);

        Ok(Envelope {
            iv,
            tag,
            ciphertext: sealed[..split].to_vec(),
        })
    }

    /// Decrypt an envelope, verifying the GCM tag.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher()?;
        let mut sealed = envelope.ciphertext.clone();
        sealed.extend_from_slice(&envelope.tag);
        cipher
            .decrypt(Nonce::from_slice(&envelope.iv), sealed.as_ref())
            .map_err(|_| VaultError::IntegrityFailure)
    }

    /// Persist an envelope under `<store>/<key>.enc`, owner-only.
    pub fn store(&self, key: &str, envelope: &Envelope) -> Result<(), VaultError> {
        std::fs::create_dir_all(&self.store_dir)?;
        let path = self.entry_path(key);
        std::fs::write(&path, envelope.to_bytes())?;
        super::paths::restrict_to_owner(&path)?;
        Ok(())
    }

    /// Load a previously stored envelope, or `None` when absent.
    pub fn load(&self, key: &str) -> Result<Option<Envelope>, VaultError> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(raw) => Ok(Some(Envelope::from_bytes(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), VaultError> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Seal and store a serializable value in one step.
    pub fn store_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), VaultError> {
        let blob = serde_json::to_vec(value)
            .map_err(|e| VaultError::KeyUnavailable(format!("serialization failed: {}", e)))?;
        let envelope = self.seal(&blob)?;
        self.store(key, &envelope)
    }

    /// Load, open and deserialize a stored value in one step.
    pub fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, VaultError> {
        let Some(envelope) = self.load(key)? else {
            return Ok(None);
        };
        let blob = self.open(&envelope)?;
        serde_json::from_slice(&blob)
            .map(Some)
            .map_err(|_| VaultError::IntegrityFailure)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.store_dir.join(format!("{}.enc", key))
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        let key = self.load_or_create_key()?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
    }

    fn load_or_create_key(&self) -> Result<[u8; 32], VaultError> {
        match std::fs::read(&self.key_path) {
            Ok(raw) if raw.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&raw);
                Ok(key)
            }
            Ok(_) => Err(VaultError::KeyUnavailable(format!(
                "{} is corrupt (expected 32 bytes)",
                self.key_path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.create_key(),
            Err(e) => Err(VaultError::KeyUnavailable(e.to_string())),
        }
    }

    fn create_key(&self) -> Result<[u8; 32], VaultError> {
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;
        }
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        std::fs::write(&self.key_path, key)
            .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;
        super::paths::restrict_to_owner(&self.key_path)
            .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seal_open_round_trip() {
        let dir = tempdir().unwrap();
        let vault = Vault::at(dir.path());

        let envelope = vault.seal(b"attack at dawn").unwrap();
        assert_eq!(vault.open(&envelope).unwrap(), b"attack at dawn");

        // Round-trip through the on-disk encoding too.
        let reparsed = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(vault.open(&reparsed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn tampered_envelope_fails_integrity() {
        let dir = tempdir().unwrap();
        let vault = Vault::at(dir.path());

        let mut envelope = vault.seal(b"secret").unwrap();
        envelope.ciphertext[0] ^= 0xff;
        assert!(matches!(
            vault.open(&envelope),
            Err(VaultError::IntegrityFailure)
        ));

        let mut envelope = vault.seal(b"secret").unwrap();
        envelope.tag[0] ^= 0x01;
        assert!(matches!(
            vault.open(&envelope),
            Err(VaultError::IntegrityFailure)
        ));
    }

    #[test]
    fn store_load_delete() {
        let dir = tempdir().unwrap();
        let vault = Vault::at(dir.path());

        let envelope = vault.seal(b"persisted").unwrap();
        vault.store("unit", &envelope).unwrap();
        let loaded = vault.load("unit").unwrap().unwrap();
        assert_eq!(vault.open(&loaded).unwrap(), b"persisted");

        vault.delete("unit").unwrap();
        assert!(vault.load("unit").unwrap().is_none());
        // Deleting a missing entry is not an error.
        vault.delete("unit").unwrap();
    }

    #[test]
    fn json_helpers_round_trip() {
        let dir = tempdir().unwrap();
        let vault = Vault::at(dir.path());

        vault
            .store_json("list", &vec!["a".to_string(), "b".to_string()])
            .unwrap();
        let loaded: Vec<String> = vault.load_json("list").unwrap().unwrap();
        assert_eq!(loaded, vec!["a", "b"]);

        let missing: Option<Vec<String>> = vault.load_json("absent").unwrap();
        assert!(missing.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let vault = Vault::at(dir.path());
        let _ = vault.seal(b"force key creation").unwrap();

        let mode = std::fs::metadata(dir.path().join("key.secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
