// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable store of API keys.
//!
//! Keys are 64-character alphanumeric tokens with a unique free-form comment, persisted as a
//! JSON file with owner-only permissions. The store generates its first key on creation so a
//! fresh daemon is immediately usable.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::fsutil;

/// Minimum (and generated) length of a key token.
pub const KEY_LENGTH: usize = 64;

/// Comment attached to the key generated on first run.
const FIRST_KEY_COMMENT: &str = "first-key";

/// Error returned by the API-key store.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// Underlying I/O failure.
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The store file is not valid JSON.
    #[error("key store decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// A key with the same comment already exists.
    #[error("a key with comment '{0}' already exists")]
    DuplicateComment(String),
}

/// An API key with its permission comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Unique, human-readable description of who holds the key and why.
    pub comment: String,
    /// The token itself.
    pub key: String,
}

/// Thread-safe store of [`ApiKey`]s backed by a private JSON file.
#[derive(Debug)]
pub struct ApiKeyStore {
    path: PathBuf,
    keys: Mutex<Vec<ApiKey>>,
}

impl ApiKeyStore {
    /// Opens the store at `path`, creating it with a generated first key if it does not exist.
    ///
    /// Loading rejects files readable by anyone but their owner.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let path = path.into();
        let keys = if path.exists() {
            fsutil::check_private_mode(&path)?;
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            let first = ApiKey {
                comment: FIRST_KEY_COMMENT.to_string(),
                key: generate_token(),
            };
            tracing::info!(path = %path.display(), "generating initial API key");
            save(&path, std::slice::from_ref(&first))?;
            vec![first]
        };

        Ok(Self {
            path,
            keys: Mutex::new(keys),
        })
    }

    /// Generates and persists a new key with the given comment.
    pub fn add_new(&self, comment: &str) -> Result<ApiKey, KeyStoreError> {
        let mut keys = self.keys.lock().expect("key store lock poisoned");
        if keys.iter().any(|key| key.comment == comment) {
            return Err(KeyStoreError::DuplicateComment(comment.to_string()));
        }

        let key = ApiKey {
            comment: comment.to_string(),
            key: generate_token(),
        };
        keys.push(key.clone());
        save(&self.path, &keys)?;
        Ok(key)
    }

    /// Returns true iff `token` matches a stored key.
    ///
    /// Tokens shorter than [`KEY_LENGTH`] are always rejected.
    pub fn is_valid_key(&self, token: &str) -> bool {
        if token.len() < KEY_LENGTH {
            return false;
        }
        self.keys
            .lock()
            .expect("key store lock poisoned")
            .iter()
            .any(|key| key.key == token)
    }

    /// Returns a snapshot of all keys for administrative listing.
    pub fn list(&self) -> Vec<ApiKey> {
        self.keys.lock().expect("key store lock poisoned").clone()
    }

    /// Serializes the store for out-of-band self-backup.
    pub fn save_to_writer(&self, writer: &mut impl Write) -> Result<(), KeyStoreError> {
        let keys = self.keys.lock().expect("key store lock poisoned");
        serde_json::to_writer(&mut *writer, &*keys)?;
        writer.flush()?;
        Ok(())
    }
}

fn save(path: &Path, keys: &[ApiKey]) -> Result<(), KeyStoreError> {
    fsutil::write_private_atomic(path, &serde_json::to_vec(keys)?)?;
    Ok(())
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_first_key_and_reloads_it() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("api-keys.db");

        let store = ApiKeyStore::open(&path)?;
        let keys = store.list();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key.len(), KEY_LENGTH);
        assert!(keys[0].key.chars().all(|c| c.is_ascii_alphanumeric()));

        let reloaded = ApiKeyStore::open(&path)?;
        assert_eq!(reloaded.list(), keys);
        Ok(())
    }

    #[test]
    fn validates_only_known_full_length_tokens() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let store = ApiKeyStore::open(dir.path().join("api-keys.db"))?;
        let token = store.list()[0].key.clone();

        assert!(store.is_valid_key(&token));
        assert!(!store.is_valid_key(&token[..KEY_LENGTH - 1]));
        assert!(!store.is_valid_key(&"x".repeat(KEY_LENGTH)));
        Ok(())
    }

    #[test]
    fn rejects_duplicate_comment() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let store = ApiKeyStore::open(dir.path().join("api-keys.db"))?;

        store.add_new("deploy bot")?;
        let error = store
            .add_new("deploy bot")
            .expect_err("duplicate comment must be rejected");
        assert!(matches!(error, KeyStoreError::DuplicateComment(_)));
        assert_eq!(store.list().len(), 2);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn refuses_world_readable_store() -> barry_test_utils::Result {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("api-keys.db");
        ApiKeyStore::open(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;

        assert!(ApiKeyStore::open(&path).is_err());
        Ok(())
    }
}
