// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-file catalog record.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::{pusher::PusherHandle, retriever::RetrieverHandle};

/// Lifecycle status of a backup file; transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Seen in the ingest directory, not yet stable.
    New,
    /// Stable and handed to the lifecycle engine.
    Queued,
    /// In the upload pool.
    Uploading,
    /// Uploaded, moved into hot storage, and recorded.
    Uploaded,
}

/// A single backup artifact tracked by the catalog.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    /// File name without the project directory.
    pub filename: String,
    /// Relative path `<project>/<filename>`; also the object path in cold storage.
    pub path: String,
    /// Modification time of the source artifact.
    pub mod_time: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// When the wait list first saw the file.
    pub added_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: FileStatus,
    /// When the hot-storage copy expires.
    pub expire_local: DateTime<Utc>,
    /// When the cold-storage copy expires.
    pub expire_remote: DateTime<Utc>,
    /// Original expression string behind `expire_local`, for display.
    #[serde(default)]
    pub expire_local_original: String,
    /// Original expression string behind `expire_remote`, for display.
    #[serde(default)]
    pub expire_remote_original: String,
    /// Remote retention duration, used for cost scoring.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub remote_keep: Duration,
    /// Whether the hot-storage copy has been deleted.
    #[serde(default)]
    pub expired_local: bool,
    /// Whether the cold-storage copy has been deleted.
    #[serde(default)]
    pub expired_remote: bool,
    /// Cold container the file was uploaded to.
    pub container: String,
    /// Cost computed from the container's expression at upload time.
    pub cost: f64,
    /// Whether the current local copy is an encryption envelope.
    #[serde(default)]
    pub encrypted: bool,
    /// When a decrypted local copy should be re-encrypted.
    #[serde(default)]
    pub re_encrypt_date: Option<DateTime<Utc>>,
    /// Where a rehydrated cold copy lives, once retrieval finished.
    #[serde(default)]
    pub retrieved_path: Option<PathBuf>,
    /// When the rehydrated copy landed.
    #[serde(default)]
    pub retrieved_date: Option<DateTime<Utc>>,
    /// In-flight retrieval, if any.
    #[serde(skip)]
    pub retriever: Option<RetrieverHandle>,
    /// In-flight outbound pushes, keyed by destination name.
    #[serde(skip)]
    pub pushers: HashMap<String, PusherHandle>,
}

impl BackupFile {
    /// The project component of [`BackupFile::path`].
    pub fn project_name(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    /// Location of the hot-storage copy below `files_dir`.
    pub fn storage_path(&self, files_dir: &std::path::Path) -> PathBuf {
        files_dir.join(&self.path)
    }

    /// The local path a download would be served from right now, if any.
    pub fn local_copy(&self, files_dir: &std::path::Path) -> Option<PathBuf> {
        if !self.expired_local {
            Some(self.storage_path(files_dir))
        } else {
            self.retrieved_path.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_is_monotonic() {
        assert!(FileStatus::New < FileStatus::Queued);
        assert!(FileStatus::Queued < FileStatus::Uploading);
        assert!(FileStatus::Uploading < FileStatus::Uploaded);
    }

    #[test]
    fn serde_skips_transient_handles() {
        let file = crate::catalog::test_support::backup_file("proj", "a.tar", 10);
        let json = serde_json::to_string(&file).expect("file should serialize");
        assert!(!json.contains("retriever"));
        assert!(!json.contains("pushers"));

        let back: BackupFile = serde_json::from_str(&json).expect("file should deserialize");
        assert_eq!(back.path, "proj/a.tar");
        assert!(back.retriever.is_none());
    }
}
