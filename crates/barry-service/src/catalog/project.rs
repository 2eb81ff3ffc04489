// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-project catalog record.

use std::{collections::HashMap, time::Duration};

use barry_core::expiration::Expiration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use super::file::BackupFile;
use crate::config::{ExpirationConfig, PROJECT_DEFAULT_BACKUP_EVERY};

/// Current project record schema; bump together with [`Project::upgrade`].
pub const SCHEMA_VERSION: u32 = 1;

/// A bucket of files sharing retention policies.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project name (the directory below the ingest root).
    pub path: String,
    /// Files by filename.
    pub files: HashMap<String, BackupFile>,
    /// Total files ever recorded, kept denormalized for listings.
    pub file_count: u64,
    /// Total bytes recorded, kept denormalized for listings.
    pub size_count: u64,
    /// Total cost recorded, kept denormalized for listings.
    pub cost_count: f64,
    /// Hot-storage retention policy.
    pub local_expiration: Expiration,
    /// Cold-storage retention policy.
    pub remote_expiration: Expiration,
    /// Expected interval between backups, for the no-backup alert.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_backup_every")]
    pub backup_every: Duration,
    /// When the last no-backup alert for this project fired.
    #[serde(default)]
    pub last_no_backup_alert: Option<DateTime<Utc>>,
    /// Archived projects are excluded from alerts and removed once empty.
    #[serde(default)]
    pub archived: bool,
    /// Record schema version, driving [`Project::upgrade`] on load.
    #[serde(default)]
    pub schema_version: u32,
}

fn default_backup_every() -> Duration {
    PROJECT_DEFAULT_BACKUP_EVERY
}

impl Project {
    /// Creates a project with retention cloned from the global configuration.
    pub fn new(path: impl Into<String>, defaults: &ExpirationConfig) -> Self {
        Self {
            path: path.into(),
            files: HashMap::new(),
            file_count: 0,
            size_count: 0,
            cost_count: 0.0,
            local_expiration: defaults.local.clone(),
            remote_expiration: defaults.remote.clone(),
            backup_every: PROJECT_DEFAULT_BACKUP_EVERY,
            last_no_backup_alert: None,
            archived: false,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// The newest file's modification time; `None` for empty projects.
    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        self.files.values().map(|file| file.mod_time).max()
    }

    /// Filenames sorted ascending by modification time.
    pub fn sorted_filenames(&self) -> Vec<String> {
        let mut files: Vec<&BackupFile> = self.files.values().collect();
        files.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then(a.filename.cmp(&b.filename)));
        files.into_iter().map(|file| file.filename.clone()).collect()
    }

    /// The most recently modified file, for the size-difference alert.
    pub fn newest_file(&self) -> Option<&BackupFile> {
        self.files.values().max_by_key(|file| file.mod_time)
    }

    /// Migrates records written by older daemon versions; returns true if anything changed.
    pub fn upgrade(&mut self) -> bool {
        let mut changed = false;
        if self.schema_version == 0 {
            // v0 records predate the no-backup alert and have no backup_every.
            self.backup_every = PROJECT_DEFAULT_BACKUP_EVERY;
            self.schema_version = 1;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support;

    #[test]
    fn upgrade_stamps_v0_records() {
        let mut project = test_support::project("proj");
        project.schema_version = 0;
        project.backup_every = Duration::ZERO;

        assert!(project.upgrade());
        assert_eq!(project.schema_version, SCHEMA_VERSION);
        assert_eq!(project.backup_every, PROJECT_DEFAULT_BACKUP_EVERY);
        assert!(!project.upgrade(), "upgrade must be idempotent");
    }

    #[test]
    fn sorted_filenames_follow_mod_time() {
        let mut project = test_support::project("proj");
        let mut old = test_support::backup_file("proj", "older.tar", 10);
        old.mod_time -= chrono::TimeDelta::hours(2);
        let recent = test_support::backup_file("proj", "recent.tar", 10);
        project.files.insert(recent.filename.clone(), recent);
        project.files.insert(old.filename.clone(), old);

        assert_eq!(project.sorted_filenames(), ["older.tar", "recent.tar"]);
        assert_eq!(project.newest_file().unwrap().filename, "recent.tar");
    }
}
