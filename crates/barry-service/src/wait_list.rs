// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The ingest-directory scanner.
//!
//! Files dropped into the ingest directory may still be written to, so nothing is promoted
//! before it has kept the same `(mod_time, size)` for a full stability window. Each scan walks
//! the tree, consults the external filter (files already in the catalog are ignored), refreshes
//! the waiting entries, and hands stable files to the queue callback exactly once.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime},
};

use barry_core::Log;
use chrono::{DateTime, Utc};

/// A file promoted out of the wait list, passed by value to the queue callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFile {
    /// File name without the project directory.
    pub filename: String,
    /// Relative path `<project>/<filename>`.
    pub path: String,
    /// Modification time observed at promotion.
    pub mod_time: DateTime<Utc>,
    /// Size in bytes observed at promotion.
    pub size: u64,
}

/// Returns false to ignore a `(project, filename)` pair entirely.
pub type FilterFn = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Invoked once per promoted file; must spawn its work and return promptly.
pub type QueueFn = dyn Fn(&str, QueuedFile) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitingStatus {
    New,
    Queued,
}

#[derive(Debug, Clone)]
struct WaitingEntry {
    mod_time: SystemTime,
    size: u64,
    added_at: SystemTime,
    status: WaitingStatus,
}

/// Scanner tracking not-yet-stable files in the ingest directory.
pub struct WaitList {
    root: PathBuf,
    stable_delay: Duration,
    filter: Box<FilterFn>,
    queue: Box<QueueFn>,
    log: Log,
    entries: Mutex<HashMap<String, HashMap<String, WaitingEntry>>>,
}

impl WaitList {
    /// Creates a wait list over the ingest directory at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        stable_delay: Duration,
        filter: Box<FilterFn>,
        queue: Box<QueueFn>,
        log: Log,
    ) -> std::io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unable to watch directory '{}'", root.display()),
            ));
        }
        Ok(Self {
            root,
            stable_delay,
            filter,
            queue,
            log,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Scans the ingest directory once.
    ///
    /// Walk errors on individual entries are logged and skipped so one unreadable file cannot
    /// stall ingestion.
    pub fn scan(&self) {
        self.scan_at(SystemTime::now());
    }

    /// Same as [`WaitList::scan`] with an explicit current time.
    pub fn scan_at(&self, now: SystemTime) {
        let mut entries = self.entries.lock().expect("wait list lock poisoned");

        // Depth 0 is the ingest root itself, which may well be a dot-directory.
        let walker = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    self.log
                        .warning(barry_core::TOPIC_GLOBAL, format!("scan error: {error}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Some((project, filename)) = split_relative(&self.root, entry.path()) else {
                continue;
            };
            if !(self.filter)(&project, &filename) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(error) => {
                    self.log
                        .warning(&project, format!("stat error on '{filename}': {error}"));
                    continue;
                }
            };
            let mod_time = metadata.modified().unwrap_or(now);
            let size = metadata.len();

            let project_entries = entries.entry(project.clone()).or_default();
            match project_entries.get_mut(&filename) {
                None => {
                    project_entries.insert(
                        filename.clone(),
                        WaitingEntry {
                            mod_time,
                            size,
                            added_at: now,
                            status: WaitingStatus::New,
                        },
                    );
                    self.log
                        .trace(&project, format!("{project}/{filename} added to wait queue"));
                }
                Some(entry) if entry.status == WaitingStatus::Queued => {}
                Some(entry) if entry.mod_time != mod_time || entry.size != size => {
                    // Still being written; restart the stability window.
                    entry.mod_time = mod_time;
                    entry.size = size;
                    entry.added_at = now;
                    self.log.trace(
                        &project,
                        format!("{project}/{filename} changed, continue waiting"),
                    );
                }
                Some(entry) => {
                    let stable_since = now
                        .duration_since(entry.added_at)
                        .unwrap_or(Duration::ZERO);
                    if stable_since < self.stable_delay {
                        self.log
                            .trace(&project, format!("{project}/{filename} still waiting"));
                        continue;
                    }
                    entry.status = WaitingStatus::Queued;
                    let queued = QueuedFile {
                        filename: filename.clone(),
                        path: format!("{project}/{filename}"),
                        mod_time: DateTime::<Utc>::from(mod_time),
                        size,
                    };
                    (self.queue)(&project, queued);
                    self.log
                        .trace(&project, format!("{project}/{filename} is ready, queued"));
                }
            }
        }
    }

    /// Forgets a tracked file so the next scan rediscovers it (used by the retry path).
    pub fn remove_file(&self, project: &str, filename: &str) {
        let mut entries = self.entries.lock().expect("wait list lock poisoned");
        if let Some(project_entries) = entries.get_mut(project) {
            project_entries.remove(filename);
            if project_entries.is_empty() {
                entries.remove(project);
            }
        }
    }
}

impl std::fmt::Debug for WaitList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitList")
            .field("root", &self.root)
            .field("stable_delay", &self.stable_delay)
            .finish_non_exhaustive()
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Splits an absolute path below `root` into `(project, filename)`.
///
/// Files directly at the ingest root (no project directory) are ignored.
fn split_relative(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let project = relative.parent()?.to_str()?;
    if project.is_empty() {
        return None;
    }
    let filename = relative.file_name()?.to_str()?;
    Some((project.to_string(), filename.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const STABLE: Duration = Duration::from_secs(90);

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        wait_list: WaitList,
        queued: Arc<Mutex<Vec<QueuedFile>>>,
    }

    fn harness_with_filter(filter: Box<FilterFn>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let queued = Arc::new(Mutex::new(Vec::new()));
        let queued_clone = queued.clone();
        let wait_list = WaitList::new(
            &root,
            STABLE,
            filter,
            Box::new(move |_project, file| queued_clone.lock().unwrap().push(file)),
            Log::default(),
        )
        .expect("wait list over tempdir");
        Harness {
            _dir: dir,
            root,
            wait_list,
            queued,
        }
    }

    fn harness() -> Harness {
        harness_with_filter(Box::new(|_, _| true))
    }

    fn drop_file(root: &Path, project: &str, filename: &str, content: &[u8]) {
        let dir = root.join(project);
        std::fs::create_dir_all(&dir).expect("project dir");
        std::fs::write(dir.join(filename), content).expect("write file");
    }

    fn queued_count(harness: &Harness) -> usize {
        harness.queued.lock().unwrap().len()
    }

    #[test]
    fn promotes_only_after_stability_window() {
        let h = harness();
        drop_file(&h.root, "proj-a", "db.tar.gz", b"dump");

        let start = SystemTime::now();
        h.wait_list.scan_at(start);
        assert_eq!(queued_count(&h), 0, "first sighting must not promote");

        h.wait_list.scan_at(start + STABLE / 2);
        assert_eq!(queued_count(&h), 0, "still inside the stability window");

        h.wait_list.scan_at(start + STABLE);
        assert_eq!(queued_count(&h), 1);
        let file = h.queued.lock().unwrap()[0].clone();
        assert_eq!(file.path, "proj-a/db.tar.gz");
        assert_eq!(file.size, 4);

        // Once queued, further scans must not promote again.
        h.wait_list.scan_at(start + STABLE * 2);
        assert_eq!(queued_count(&h), 1);
    }

    #[test]
    fn churn_restarts_the_stability_window() {
        let h = harness();
        drop_file(&h.root, "proj-a", "db.tar.gz", b"v1");

        let start = SystemTime::now();
        h.wait_list.scan_at(start);

        // The writer touches the file inside the window.
        drop_file(&h.root, "proj-a", "db.tar.gz", b"version 2");
        let touched = start + STABLE / 2;
        h.wait_list.scan_at(touched);
        assert_eq!(queued_count(&h), 0);

        // A full window from the *change* is required, not from the first sighting.
        h.wait_list.scan_at(start + STABLE);
        assert_eq!(queued_count(&h), 0);
        h.wait_list.scan_at(touched + STABLE);
        assert_eq!(queued_count(&h), 1);
    }

    #[test]
    fn filter_rejects_known_files() {
        let h = harness_with_filter(Box::new(|_, filename| filename != "known.tar"));
        drop_file(&h.root, "proj-a", "known.tar", b"data");
        drop_file(&h.root, "proj-a", "new.tar", b"data");

        let start = SystemTime::now();
        h.wait_list.scan_at(start);
        h.wait_list.scan_at(start + STABLE);

        let queued = h.queued.lock().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].filename, "new.tar");
    }

    #[test]
    fn ignores_dot_files_dot_dirs_and_root_files() {
        let h = harness();
        drop_file(&h.root, "proj-a", ".partial", b"x");
        drop_file(&h.root, ".staging", "db.tar", b"x");
        std::fs::write(h.root.join("stray-root-file"), b"x").expect("write");

        let start = SystemTime::now();
        h.wait_list.scan_at(start);
        h.wait_list.scan_at(start + STABLE);
        assert_eq!(queued_count(&h), 0);
    }

    #[test]
    fn remove_file_allows_rediscovery() {
        let h = harness();
        drop_file(&h.root, "proj-a", "db.tar.gz", b"dump");

        let start = SystemTime::now();
        h.wait_list.scan_at(start);
        h.wait_list.scan_at(start + STABLE);
        assert_eq!(queued_count(&h), 1);

        h.wait_list.remove_file("proj-a", "db.tar.gz");

        // Rediscovered as a fresh entry: a new full window applies.
        let again = start + STABLE * 2;
        h.wait_list.scan_at(again);
        assert_eq!(queued_count(&h), 1);
        h.wait_list.scan_at(again + STABLE);
        assert_eq!(queued_count(&h), 2);
    }

    #[test]
    fn queues_every_stable_file_of_a_project() {
        let h = harness();
        for name in ["a.tar", "b.tar", "c.tar"] {
            drop_file(&h.root, "proj", name, b"data");
        }

        let start = SystemTime::now();
        h.wait_list.scan_at(start);
        h.wait_list.scan_at(start + STABLE);

        let queued = h.queued.lock().unwrap();
        let mut names: Vec<&str> = queued.iter().map(|f| f.filename.as_str()).collect();
        names.sort();
        assert_eq!(names, ["a.tar", "b.tar", "c.tar"]);
    }
}
