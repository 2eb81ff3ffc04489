// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The durable project/file catalog.
//!
//! One process-wide lock guards the whole catalog; every public method takes it for its entire
//! duration. That is deliberate: throughput is bounded by the upload pool and the network, not
//! by catalog contention. The rule that keeps this safe is that no I/O happens under the
//! lock: anything touching the filesystem or the object store is handed to the injected
//! [`CatalogHooks`], which spawn their work on independent tasks.
//!
//! Every mutation persists the catalog before returning, so the on-disk JSON only ever
//! reflects completed state transitions.

mod file;
mod project;

use std::{collections::HashMap, io::Write, path::PathBuf, sync::Mutex};

use barry_core::{expiration::Expiration, fsutil, Log};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use self::{
    file::{BackupFile, FileStatus},
    project::{Project, SCHEMA_VERSION},
};
use crate::{alert::Alert, config::ExpirationConfig};

/// Error returned by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Underlying I/O failure.
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The catalog file is not valid JSON.
    #[error("catalog decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// An operation referenced a project that does not exist.
    #[error("project '{0}' not found")]
    UnknownProject(String),
    /// `add_file` would overwrite an existing record.
    #[error("file '{filename}' already exists in project '{project}'")]
    DuplicateFile {
        /// Project name.
        project: String,
        /// Colliding filename.
        filename: String,
    },
    /// An operation referenced a file that does not exist.
    #[error("file '{filename}' not found in project '{project}'")]
    FileNotFound {
        /// Project name.
        project: String,
        /// Missing filename.
        filename: String,
    },
}

/// Callbacks the catalog needs from the lifecycle engine, injected at construction.
///
/// All three are invoked from inside the catalog lock and must therefore only spawn work and
/// return; none of them may call back into the catalog synchronously.
pub struct CatalogHooks {
    /// Deletes a local file (hot-storage or retrieved copy) asynchronously.
    pub delete_local: Box<dyn Fn(&str, PathBuf) + Send + Sync>,
    /// Deletes the remote copy of a file asynchronously, retrying as needed.
    pub delete_remote: Box<dyn Fn(BackupFile) + Send + Sync>,
    /// Sends an operator alert.
    pub alert: Box<dyn Fn(Alert) + Send + Sync>,
}

impl CatalogHooks {
    /// Hooks that do nothing; for tools that only read the catalog.
    pub fn noop() -> Self {
        Self {
            delete_local: Box::new(|_, _| {}),
            delete_remote: Box::new(|_| {}),
            alert: Box::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for CatalogHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CatalogHooks")
    }
}

/// Aggregate catalog statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CatalogStats {
    /// Number of projects.
    pub projects: usize,
    /// Number of tracked files.
    pub files: usize,
    /// Sum of tracked file sizes in bytes.
    pub total_size: u64,
    /// Sum of computed storage costs.
    pub total_cost: f64,
}

/// A file due for re-encryption, as handed to the engine.
#[derive(Debug, Clone)]
pub struct ReEncryptCandidate {
    /// Project name.
    pub project: String,
    /// Filename within the project.
    pub filename: String,
    /// The plaintext local copy to encrypt in place.
    pub local_path: PathBuf,
}

#[derive(Debug, Default)]
struct CatalogInner {
    projects: HashMap<String, Project>,
    /// One-shot remote-retention overrides keyed by `<project>/<filename>`, set by the manual
    /// upload path and consumed by the next expiration evaluation. Never persisted.
    remote_overrides: HashMap<String, Expiration>,
}

/// The durable map of projects and files.
pub struct Catalog {
    path: PathBuf,
    files_dir: PathBuf,
    default_expiration: ExpirationConfig,
    hooks: CatalogHooks,
    log: Log,
    inner: Mutex<CatalogInner>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Opens the catalog at `path`, creating an empty one if the file does not exist.
    ///
    /// Loading rejects files readable by anyone but their owner, runs per-project record
    /// upgrades, and saves immediately so write problems surface at startup.
    pub fn open(
        path: impl Into<PathBuf>,
        files_dir: impl Into<PathBuf>,
        default_expiration: ExpirationConfig,
        hooks: CatalogHooks,
        log: Log,
    ) -> Result<Self, CatalogError> {
        let path = path.into();
        let mut projects: HashMap<String, Project> = if path.exists() {
            fsutil::check_private_mode(&path)?;
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            HashMap::new()
        };

        for project in projects.values_mut() {
            if project.upgrade() {
                log.info(
                    &project.path.clone(),
                    format!("project record upgraded to schema v{}", project.schema_version),
                );
            }
        }

        let catalog = Self {
            path,
            files_dir: files_dir.into(),
            default_expiration,
            hooks,
            log,
            inner: Mutex::new(CatalogInner {
                projects,
                remote_overrides: HashMap::new(),
            }),
        };
        catalog.save_locked(&catalog.inner.lock().expect("catalog lock poisoned"))?;
        Ok(catalog)
    }

    fn save_locked(&self, inner: &CatalogInner) -> Result<(), CatalogError> {
        fsutil::write_private_atomic(&self.path, &serde_json::to_vec(&inner.projects)?)?;
        Ok(())
    }

    /// Persists under the lock, logging instead of propagating; used by the scheduled loops.
    fn save_or_log(&self, inner: &CatalogInner) {
        if let Err(error) = self.save_locked(inner) {
            self.log
                .error_global(format!("error saving catalog: {error}"));
        }
    }

    /// Returns the project, creating (and persisting) it with default policies if missing.
    pub fn find_or_create_project(&self, name: &str) -> Result<Project, CatalogError> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        if let Some(project) = inner.projects.get(name) {
            return Ok(project.clone());
        }
        let project = Project::new(name, &self.default_expiration);
        inner.projects.insert(name.to_string(), project.clone());
        self.save_locked(&inner)?;
        self.log
            .info(name, format!("project '{name}' created in catalog"));
        Ok(project)
    }

    /// Whether `<project>/<filename>` is already recorded.
    pub fn file_exists(&self, project: &str, filename: &str) -> bool {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner
            .projects
            .get(project)
            .is_some_and(|project| project.files.contains_key(filename))
    }

    /// Returns a snapshot of the file record.
    pub fn find_file(&self, project: &str, filename: &str) -> Option<BackupFile> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner
            .projects
            .get(project)?
            .files
            .get(filename)
            .cloned()
    }

    /// The most recently modified file of a project, for the size-difference alert.
    pub fn newest_file(&self, project: &str) -> Option<BackupFile> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner.projects.get(project)?.newest_file().cloned()
    }

    /// Records an uploaded file.
    ///
    /// Fails if the project is unknown or the filename collides. Ingesting into an archived
    /// project un-archives it and notifies the operator.
    pub fn add_file(&self, project_name: &str, file: BackupFile) -> Result<(), CatalogError> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let project = inner
            .projects
            .get_mut(project_name)
            .ok_or_else(|| CatalogError::UnknownProject(project_name.to_string()))?;
        if project.files.contains_key(&file.filename) {
            return Err(CatalogError::DuplicateFile {
                project: project_name.to_string(),
                filename: file.filename.clone(),
            });
        }

        if project.archived {
            project.archived = false;
            (self.hooks.alert)(Alert {
                kind: crate::alert::AlertKind::Good,
                subject: format!("project '{project_name}' un-archived"),
                content: format!(
                    "a new backup '{}' arrived for archived project '{project_name}'; \
                     the project is active again",
                    file.filename
                ),
            });
        }

        project.file_count += 1;
        project.size_count += file.size;
        project.cost_count += file.cost;
        let path = file.path.clone();
        project.files.insert(file.filename.clone(), file);
        self.save_locked(&inner)?;
        self.log
            .info(project_name, format!("{path} added to catalog"));
        Ok(())
    }

    /// Evaluates both retention policies for a new file and returns the selected lines.
    ///
    /// Both policies' file counters are incremented and persisted. A pending remote-expiration
    /// override for `virtual_path` (set by the manual upload endpoint) is applied and consumed.
    pub fn next_expiration(
        &self,
        project_name: &str,
        virtual_path: &str,
        mod_time: DateTime<Utc>,
    ) -> Result<
        (
            barry_core::expiration::ExpirationLine,
            barry_core::expiration::ExpirationLine,
        ),
        CatalogError,
    > {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let override_remote = inner.remote_overrides.remove(virtual_path);
        let project = inner
            .projects
            .get_mut(project_name)
            .ok_or_else(|| CatalogError::UnknownProject(project_name.to_string()))?;

        let local = project.local_expiration.next(mod_time);
        let remote = match override_remote {
            Some(mut expiration) => {
                // The counter of the real policy still advances for cadence purposes.
                project.remote_expiration.next(mod_time);
                expiration.next(mod_time)
            }
            None => project.remote_expiration.next(mod_time),
        };
        self.save_locked(&inner)?;
        Ok((local, remote))
    }

    /// Registers a one-shot remote-retention override for the next ingest of `virtual_path`.
    pub fn set_remote_expiration_override(&self, virtual_path: &str, expiration: Expiration) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        inner
            .remote_overrides
            .insert(virtual_path.to_string(), expiration);
    }

    /// All project names, sorted.
    pub fn project_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        let mut names: Vec<String> = inner.projects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of a project record.
    pub fn project(&self, name: &str) -> Option<Project> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner.projects.get(name).cloned()
    }

    /// Filenames of a project, ascending by modification time.
    pub fn get_filenames(&self, project: &str) -> Result<Vec<String>, CatalogError> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner
            .projects
            .get(project)
            .map(Project::sorted_filenames)
            .ok_or_else(|| CatalogError::UnknownProject(project.to_string()))
    }

    /// Applies a mutation to a project record and persists.
    pub fn update_project<R>(
        &self,
        name: &str,
        update: impl FnOnce(&mut Project) -> R,
    ) -> Result<R, CatalogError> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let project = inner
            .projects
            .get_mut(name)
            .ok_or_else(|| CatalogError::UnknownProject(name.to_string()))?;
        let result = update(project);
        self.save_locked(&inner)?;
        Ok(result)
    }

    /// Applies a mutation to a file record and persists.
    pub fn update_file<R>(
        &self,
        project: &str,
        filename: &str,
        update: impl FnOnce(&mut BackupFile) -> R,
    ) -> Result<R, CatalogError> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let file = inner
            .projects
            .get_mut(project)
            .ok_or_else(|| CatalogError::UnknownProject(project.to_string()))?
            .files
            .get_mut(filename)
            .ok_or_else(|| CatalogError::FileNotFound {
                project: project.to_string(),
                filename: filename.to_string(),
            })?;
        let result = update(file);
        self.save_locked(&inner)?;
        Ok(result)
    }

    /// Aggregate statistics over all projects.
    pub fn stats(&self) -> CatalogStats {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        let mut stats = CatalogStats {
            projects: inner.projects.len(),
            files: 0,
            total_size: 0,
            total_cost: 0.0,
        };
        for project in inner.projects.values() {
            stats.files += project.files.len();
            for file in project.files.values() {
                stats.total_size += file.size;
                stats.total_cost += file.cost;
            }
        }
        stats
    }

    /// Serializes the catalog for out-of-band self-backup.
    pub fn save_to_writer(&self, writer: &mut impl Write) -> Result<(), CatalogError> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        serde_json::to_writer(&mut *writer, &inner.projects)?;
        writer.flush()?;
        Ok(())
    }

    /// Marks files whose hot-storage retention elapsed and schedules their local deletion.
    pub fn expire_local_files(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let mut modified = false;
        for project in inner.projects.values_mut() {
            for file in project.files.values_mut() {
                if file.expired_local || now <= file.expire_local {
                    continue;
                }
                file.expired_local = true;
                // The plaintext copy is going away; logically the file is encrypted again, so
                // a future retrieval goes back through the cold envelope.
                if !file.encrypted && file.re_encrypt_date.is_some() {
                    file.encrypted = true;
                    file.re_encrypt_date = None;
                }
                modified = true;
                self.log.info(
                    &project.path,
                    format!("deleting expired local storage file '{}'", file.path),
                );
                (self.hooks.delete_local)(&project.path, self.files_dir.join(&file.path));
            }
        }
        if modified {
            self.save_or_log(&inner);
        }
    }

    /// Marks files whose cold-storage retention elapsed and schedules their remote deletion.
    pub fn expire_remote_files(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let mut modified = false;
        for project in inner.projects.values_mut() {
            for file in project.files.values_mut() {
                if file.expired_remote || now <= file.expire_remote {
                    continue;
                }
                file.expired_remote = true;
                modified = true;
                self.log.info(
                    &project.path,
                    format!("remote file '{}' marked as expired", file.path),
                );
                (self.hooks.delete_remote)(file.clone());
            }
        }
        if modified {
            self.save_or_log(&inner);
        }
    }

    /// Removes fully expired records and empty archived projects.
    pub fn expire_clean(&self, _now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let mut modified = false;

        for project in inner.projects.values_mut() {
            let log = &self.log;
            let hooks = &self.hooks;
            let path = project.path.clone();
            project.files.retain(|_, file| {
                if !(file.expired_local && file.expired_remote) {
                    return true;
                }
                if let Some(retrieved) = file.retrieved_path.take() {
                    (hooks.delete_local)(&path, retrieved);
                }
                log.info(&path, format!("file '{}' removed from catalog", file.path));
                modified = true;
                false
            });
        }

        let removed: Vec<String> = inner
            .projects
            .values()
            .filter(|project| project.archived && project.files.is_empty())
            .map(|project| project.path.clone())
            .collect();
        for name in removed {
            inner.projects.remove(&name);
            modified = true;
            self.log
                .info(&name, format!("empty archived project '{name}' removed"));
        }

        if modified {
            self.save_or_log(&inner);
        }
    }

    /// Sends one batched alert for projects overdue for a backup.
    ///
    /// A project is overdue when its newest file is older than 1.5 × `backup_every`; each
    /// project re-alerts at most once per `backup_every` window.
    pub fn no_backup_alerts(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let mut overdue: Vec<String> = Vec::new();
        for project in inner.projects.values_mut() {
            if project.archived {
                continue;
            }
            let Some(mod_time) = project.mod_time() else {
                continue;
            };
            let Ok(backup_every) = chrono::TimeDelta::from_std(project.backup_every) else {
                continue;
            };
            if now - mod_time <= backup_every + backup_every / 2 {
                continue;
            }
            if let Some(last) = project.last_no_backup_alert {
                if now - last <= backup_every {
                    continue;
                }
            }
            project.last_no_backup_alert = Some(now);
            overdue.push(format!(
                "project '{}': last backup {}",
                project.path,
                mod_time.to_rfc3339()
            ));
            self.log
                .warning(&project.path, "no recent backup for project");
        }

        if !overdue.is_empty() {
            self.save_or_log(&inner);
            (self.hooks.alert)(Alert {
                kind: crate::alert::AlertKind::Bad,
                subject: format!("{} project(s) without recent backup", overdue.len()),
                content: overdue.join("\n"),
            });
        }
    }

    /// Returns one file due for re-encryption, if any.
    ///
    /// Candidates are handed out one at a time; the engine encrypts outside the lock and then
    /// reports back through [`Catalog::mark_re_encrypted`], so this naturally runs serially.
    pub fn next_re_encrypt_candidate(&self, now: DateTime<Utc>) -> Option<ReEncryptCandidate> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        for project in inner.projects.values() {
            for file in project.files.values() {
                if file.encrypted {
                    continue;
                }
                let Some(due) = file.re_encrypt_date else {
                    continue;
                };
                if due > now {
                    continue;
                }
                let Some(local_path) = file.local_copy(&self.files_dir) else {
                    continue;
                };
                return Some(ReEncryptCandidate {
                    project: project.path.clone(),
                    filename: file.filename.clone(),
                    local_path,
                });
            }
        }
        None
    }

    /// Records a completed re-encryption.
    pub fn mark_re_encrypted(&self, project: &str, filename: &str) -> Result<(), CatalogError> {
        self.update_file(project, filename, |file| {
            file.encrypted = true;
            file.re_encrypt_date = None;
        })
    }
}
