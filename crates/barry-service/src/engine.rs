// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The backup lifecycle engine.
//!
//! Orchestrates the whole pipeline around the catalog: promotes stable ingest files through
//! upload, hot-storage move and recording; retries failures by pushing files back into the
//! wait list; drives the sealed → unsealing → unsealed → retrieving → available state machine
//! for downloads; and runs the scheduled maintenance loops (expiration, no-backup alerts,
//! re-encryption, self-backup, keep-alive stats).

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use barry_core::{
    envelope::{self, EnvelopeError},
    keys::ApiKeyStore,
    Log,
};
use barry_swift::{AvailabilityState, ObjectStore, ObjectStoreError};
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use serde_with::{serde_as, DurationSeconds};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    alert::{AlertSender, Alerter},
    catalog::{BackupFile, Catalog, CatalogError, CatalogHooks, FileStatus},
    config::{AppConfig, EncryptionKeys, Tuning},
    pusher::spawn_pusher,
    retriever::spawn_retriever,
    stats::{format_bytes, Stats},
    wait_list::{QueuedFile, WaitList},
    workers::{Encrypter, Uploader},
};

/// Error returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Catalog operation failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Object-store operation failed.
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    /// Envelope encoding or decoding failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Local filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The requested file is not in the catalog.
    #[error("file '{filename}' not found in project '{project}'")]
    FileNotFound {
        /// Project name.
        project: String,
        /// Missing filename.
        filename: String,
    },
    /// No `[[container]]` section is configured.
    #[error("no container configured")]
    NoContainers,
    /// The file has no local copy; callers must poll `file/status` first.
    #[error("file '{0}' is not available locally, query its status first")]
    NotAvailable(String),
    /// A finished retrieval reported an error.
    #[error("retrieval failed: {0}")]
    Retrieval(String),
    /// The requested push destination is not configured.
    #[error("unknown push destination '{0}'")]
    UnknownDestination(String),
}

/// Client-facing availability of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatusKind {
    /// A local copy can be downloaded right now.
    Available,
    /// A cold copy is being streamed back to local disk.
    Retrieving,
    /// The cold object is being unsealed by the provider.
    Unsealing,
}

/// Availability plus the estimated time until the file becomes downloadable.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileAvailability {
    /// Current state.
    pub status: FileStatusKind,
    /// Seconds until available; zero when [`FileStatusKind::Available`].
    #[serde_as(as = "DurationSeconds<u64>")]
    pub eta: Duration,
}

impl FileAvailability {
    fn available() -> Self {
        Self {
            status: FileStatusKind::Available,
            eta: Duration::ZERO,
        }
    }
}

/// Progress of one outbound push.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct PushStatusEntry {
    /// Destination name.
    pub destination: String,
    /// Whether the push has completed.
    pub finished: bool,
    /// Error message if the push failed.
    pub error: Option<String>,
    /// Seconds until the push completes.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub eta: Duration,
    /// Bytes already pushed.
    pub copied: u64,
    /// Total bytes to push.
    pub total: u64,
}

/// Daemon status summary served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Daemon version.
    pub version: &'static str,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Files currently queued or being ingested.
    pub queue_size: u64,
    /// Number of projects in the catalog.
    pub projects: usize,
    /// Number of files in the catalog.
    pub files: usize,
    /// Total tracked bytes.
    pub total_size: u64,
    /// Total computed storage cost.
    pub total_cost: f64,
    /// Upload worker statuses.
    pub uploaders: Vec<String>,
    /// Encryption worker statuses.
    pub encrypters: Vec<String>,
}

struct EngineInner {
    config: AppConfig,
    tuning: Tuning,
    catalog: Arc<Catalog>,
    wait_list: Arc<WaitList>,
    uploader: Uploader,
    encrypter: Encrypter,
    store: Arc<dyn ObjectStore>,
    alerter: Alerter,
    api_keys: Arc<ApiKeyStore>,
    encryption: EncryptionKeys,
    log: Log,
    stats: Stats,
    queue_size: Arc<AtomicU64>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, QueuedFile)>>>,
    started_at: std::time::Instant,
}

/// Cheaply clonable handle on the daemon engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("queue_path", &self.inner.config.queue_path)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds the engine with production tuning.
    pub async fn new(
        config: AppConfig,
        store: Arc<dyn ObjectStore>,
        alert_sender: Arc<dyn AlertSender>,
        log: Log,
    ) -> anyhow::Result<Self> {
        Self::with_tuning(config, store, alert_sender, log, Tuning::default()).await
    }

    /// Builds the engine with explicit tuning; tests use this to shrink the delays.
    pub async fn with_tuning(
        config: AppConfig,
        store: Arc<dyn ObjectStore>,
        alert_sender: Arc<dyn AlertSender>,
        log: Log,
        tuning: Tuning,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        config.check_paths()?;
        let expiration = config.parse_expiration()?;
        let encryption = config.load_encryption_keys()?;
        let api_keys = Arc::new(ApiKeyStore::open(config.api_keys_path())?);
        let alerter = Alerter::new(alert_sender, log.clone());

        for container in &config.containers {
            store.check_container(&container.name).await?;
        }
        if let Some(container) = &config.self_backup_container {
            store.check_container(container).await?;
        }

        let catalog = Arc::new(Catalog::open(
            config.catalog_path(),
            config.files_dir(),
            expiration,
            Self::catalog_hooks(
                store.clone(),
                alerter.clone(),
                log.clone(),
                tuning.retry_delay,
            ),
            log.clone(),
        )?);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_size = Arc::new(AtomicU64::new(0));
        let wait_list = {
            let catalog = catalog.clone();
            let queue_size = queue_size.clone();
            Arc::new(WaitList::new(
                &config.queue_path,
                tuning.queue_stable_delay,
                Box::new(move |project, filename| !catalog.file_exists(project, filename)),
                Box::new(move |project, file| {
                    queue_size.fetch_add(1, Ordering::Relaxed);
                    // The engine side of this channel outlives the wait list.
                    let _ = queue_tx.send((project.to_string(), file));
                }),
                log.clone(),
            )?)
        };

        let uploader = Uploader::start(
            config.num_uploaders,
            store.clone(),
            config.queue_path.clone(),
        );
        let encrypter = Encrypter::start(config.num_encrypters);

        log.info_global(format!(
            "barry {} started, watching '{}'",
            env!("CARGO_PKG_VERSION"),
            config.queue_path.display()
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                tuning,
                catalog,
                wait_list,
                uploader,
                encrypter,
                store,
                alerter,
                api_keys,
                encryption,
                log,
                stats: Stats::new(),
                queue_size,
                queue_rx: Mutex::new(Some(queue_rx)),
                started_at: std::time::Instant::now(),
            }),
        })
    }

    fn catalog_hooks(
        store: Arc<dyn ObjectStore>,
        alerter: Alerter,
        log: Log,
        retry_delay: Duration,
    ) -> CatalogHooks {
        let delete_log = log.clone();
        let alert_hook = alerter.clone();
        CatalogHooks {
            delete_local: Box::new(move |project, path| {
                let log = delete_log.clone();
                let project = project.to_string();
                tokio::spawn(async move {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        log.error(
                            &project,
                            format!("error deleting local file '{}': {error}", path.display()),
                        );
                    }
                });
            }),
            delete_remote: Box::new(move |file| {
                let store = store.clone();
                let alerter = alerter.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let project = file.project_name().to_string();
                    loop {
                        match store.delete(&file.container, &file.path).await {
                            Ok(()) => {
                                log.success(&project, format!("remote file '{}' deleted", file.path));
                                return;
                            }
                            Err(error) if error.is_not_found() => {
                                log.warning(
                                    &project,
                                    format!("remote file '{}' was already gone", file.path),
                                );
                                alerter.bad(
                                    format!("remote delete of '{}'", file.path),
                                    format!("object not found on delete: {error}"),
                                );
                                return;
                            }
                            Err(error) => {
                                log.error(
                                    &project,
                                    format!("error deleting remote file '{}': {error}", file.path),
                                );
                                alerter.bad(
                                    format!("remote delete of '{}'", file.path),
                                    format!("will retry in {}: {error}", humantime::format_duration(retry_delay)),
                                );
                                tokio::time::sleep(retry_delay).await;
                            }
                        }
                    }
                });
            }),
            alert: Box::new(move |alert| alert_hook.send(alert)),
        }
    }

    /// Spawns all scheduled tasks; they stop when `cancel` fires.
    pub fn spawn_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Queue consumer: every promoted file becomes an independent ingest task.
        if let Some(mut rx) = self.inner.queue_rx.lock().expect("queue lock poisoned").take() {
            let engine = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => {
                            let Some((project, file)) = received else { break };
                            let engine = engine.clone();
                            tokio::spawn(async move { engine.ingest(project, file).await });
                        }
                    }
                }
            }));
        }

        handles.push(self.spawn_loop(cancel, self.inner.tuning.queue_scan_delay, |engine| async move {
            // The walk is synchronous filesystem work; keep it off the async workers.
            let wait_list = engine.inner.wait_list.clone();
            let _ = tokio::task::spawn_blocking(move || wait_list.scan()).await;
        }));
        handles.push(self.spawn_loop(cancel, self.inner.tuning.check_expire_every, |engine| async move {
            let now = Utc::now();
            engine.inner.catalog.expire_local_files(now);
            engine.inner.catalog.expire_remote_files(now);
            engine.inner.catalog.expire_clean(now);
        }));
        handles.push(self.spawn_loop(
            cancel,
            self.inner.tuning.no_backup_alert_schedule,
            |engine| async move {
                engine.inner.catalog.no_backup_alerts(Utc::now());
            },
        ));
        handles.push(self.spawn_loop(cancel, self.inner.tuning.check_expire_every, |engine| async move {
            engine.re_encrypt_due_files().await;
        }));
        if self.inner.config.self_backup_container.is_some() {
            handles.push(self.spawn_loop(cancel, self.inner.tuning.self_backup_delay, |engine| async move {
                if let Err(error) = engine.self_backup().await {
                    engine.inner.log.error_global(format!("self-backup failed: {error}"));
                    engine.inner.alerter.bad("self-backup failed", error.to_string());
                }
            }));
        }
        handles.push(self.spawn_loop(cancel, self.inner.tuning.keep_alive_delay, |engine| async move {
            let report = engine.inner.stats.report("daily report");
            engine.inner.alerter.good("keep-alive", report);
        }));

        handles
    }

    fn spawn_loop<F, Fut>(
        &self,
        cancel: &CancellationToken,
        period: Duration,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Engine) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let engine = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                body(engine.clone()).await;
            }
        })
    }

    /// Ingests one promoted file; never returns an error (failures re-enter the wait list).
    pub async fn ingest(&self, project: String, queued: QueuedFile) {
        if let Err(error) = self.ingest_inner(&project, &queued).await {
            self.unqueue_file(&project, &queued.filename, &error).await;
        }
        self.inner.queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    async fn ingest_inner(&self, project: &str, queued: &QueuedFile) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.catalog.find_or_create_project(project)?;
        let (local, remote) = inner
            .catalog
            .next_expiration(project, &queued.path, queued.mod_time)?;

        self.diff_size_alert(project, queued);

        let mut file = BackupFile {
            filename: queued.filename.clone(),
            path: queued.path.clone(),
            mod_time: queued.mod_time,
            size: queued.size,
            added_at: Utc::now(),
            status: FileStatus::Queued,
            expire_local: queued.mod_time + delta(local.keep),
            expire_remote: queued.mod_time + delta(remote.keep),
            expire_local_original: local.original,
            expire_remote_original: remote.original,
            remote_keep: remote.keep,
            expired_local: false,
            expired_remote: false,
            container: String::new(),
            cost: 0.0,
            encrypted: false,
            re_encrypt_date: None,
            retrieved_path: None,
            retrieved_date: None,
            retriever: None,
            pushers: Default::default(),
        };

        if let Some((key_name, key)) = inner.encryption.default_key() {
            let source = inner.config.queue_path.join(&file.path);
            // A crash after a previous encryption leaves an envelope behind; wrapping it again
            // would make it undecryptable.
            if !has_envelope_magic(&source).await? {
                inner
                    .encrypter
                    .submit(source, key_name.to_string(), key, file.path.clone())
                    .await?;
            }
            file.encrypted = true;
        }

        self.upload_and_store(project, file).await
    }

    fn diff_size_alert(&self, project: &str, queued: &QueuedFile) {
        let Some(previous) = self.inner.catalog.newest_file(project) else {
            return;
        };
        let threshold_size = self.inner.tuning.diff_alert_min_size;
        if queued.size.max(previous.size) < threshold_size || previous.size == 0 {
            return;
        }
        let diff_perc = (queued.size.abs_diff(previous.size) * 100) / previous.size;
        if diff_perc > self.inner.tuning.diff_alert_threshold_perc {
            self.inner.alerter.bad(
                format!("size difference on '{}'", queued.path),
                format!(
                    "'{}' is {} while the previous backup '{}' was {} ({diff_perc}% difference)",
                    queued.filename,
                    format_bytes(queued.size),
                    previous.filename,
                    format_bytes(previous.size),
                ),
            );
        }
    }

    async fn upload_and_store(&self, project: &str, mut file: BackupFile) -> Result<(), EngineError> {
        let inner = &self.inner;
        let (container, cost) = self.cheapest_container(file.size, file.remote_keep)?;
        file.container = container;
        file.cost = cost;
        file.status = FileStatus::Uploading;

        inner
            .uploader
            .submit(project.to_string(), file.clone())
            .await?;

        let source = inner.config.queue_path.join(&file.path);
        let dest = inner.config.files_dir().join(&file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Same-device rename, verified at startup; no byte copy happens here.
        tokio::fs::rename(&source, &dest).await?;

        file.status = FileStatus::Uploaded;
        let size = file.size;
        let path = file.path.clone();
        inner.catalog.add_file(project, file)?;
        inner.stats.inc(1, size);
        inner.log.success(
            project,
            format!("'{path}' uploaded and stored ({})", format_bytes(size)),
        );
        Ok(())
    }

    async fn unqueue_file(&self, project: &str, filename: &str, error: &EngineError) {
        let inner = &self.inner;
        inner.log.error(
            project,
            format!("error with '{project}/{filename}': {error}; will retry"),
        );
        inner.alerter.bad(
            format!("backup of '{project}/{filename}' failed"),
            format!(
                "{error}\nthe file returns to the queue in {}",
                humantime::format_duration(inner.tuning.retry_delay)
            ),
        );
        tokio::time::sleep(inner.tuning.retry_delay).await;
        inner.wait_list.remove_file(project, filename);
    }

    /// Picks the cheapest configured container for a file; ties resolve to configuration order.
    fn cheapest_container(
        &self,
        size: u64,
        remote_keep: Duration,
    ) -> Result<(String, f64), EngineError> {
        let mut best: Option<(&str, f64)> = None;
        for container in &self.inner.config.containers {
            let cost = container.cost.evaluate(size, remote_keep);
            match best {
                Some((_, best_cost)) if best_cost <= cost => {}
                _ => best = Some((&container.name, cost)),
            }
        }
        best.map(|(name, cost)| (name.to_string(), cost))
            .ok_or(EngineError::NoContainers)
    }

    /// The download-prep state machine; idempotent and designed to be polled.
    pub async fn make_file_available(
        &self,
        project: &str,
        filename: &str,
    ) -> Result<FileAvailability, EngineError> {
        let inner = &self.inner;
        let file = inner
            .catalog
            .find_file(project, filename)
            .ok_or_else(|| EngineError::FileNotFound {
                project: project.to_string(),
                filename: filename.to_string(),
            })?;

        if !file.expired_local || file.retrieved_path.is_some() {
            return Ok(FileAvailability::available());
        }

        if let Some(retriever) = &file.retriever {
            if !retriever.is_finished() {
                return Ok(FileAvailability {
                    status: FileStatusKind::Retrieving,
                    eta: retriever.eta(),
                });
            }
            if let Some(error) = retriever.error() {
                inner
                    .catalog
                    .update_file(project, filename, |file| file.retriever = None)?;
                return Err(EngineError::Retrieval(error));
            }
            let dest = retriever.destination().clone();
            let decrypted = retriever.decrypts();
            inner.catalog.update_file(project, filename, |file| {
                file.retrieved_path = Some(dest);
                file.retrieved_date = Some(Utc::now());
                if decrypted {
                    file.encrypted = false;
                }
                file.retriever = None;
            })?;
            inner
                .log
                .success(project, format!("'{}' retrieved from cold storage", file.path));
            return Ok(FileAvailability::available());
        }

        let availability = inner
            .store
            .get_object_availability(&file.container, &file.path)
            .await?;
        match availability.state {
            AvailabilityState::Sealed => {
                let eta = inner.store.unseal(&file.container, &file.path).await?;
                inner.log.info(
                    project,
                    format!("unsealing '{}' requested (eta {}s)", file.path, eta.as_secs()),
                );
                Ok(FileAvailability {
                    status: FileStatusKind::Unsealing,
                    eta,
                })
            }
            AvailabilityState::Unsealing => Ok(FileAvailability {
                status: FileStatusKind::Unsealing,
                eta: availability.eta,
            }),
            AvailabilityState::Unsealed => {
                // Retrieved copies are namespaced by project to avoid cross-project name
                // collisions.
                let dest = inner
                    .config
                    .retrieved_dir()
                    .join(project)
                    .join(filename);
                let key_lookup = (!inner.encryption.is_empty()).then(|| {
                    let keys = inner.encryption.clone();
                    Arc::new(move |name: &str| keys.lookup(name))
                        as Arc<dyn Fn(&str) -> Option<envelope::Key> + Send + Sync>
                });
                let handle = spawn_retriever(
                    inner.store.clone(),
                    file.container.clone(),
                    file.path.clone(),
                    dest,
                    key_lookup,
                );
                let eta = handle.eta();
                let re_encrypt_at = Utc::now() + delta(inner.tuning.re_encrypt_delay);
                inner.catalog.update_file(project, filename, |file| {
                    file.retriever = Some(handle);
                    // The rehydrated copy lands decrypted; arm its re-encryption now.
                    file.re_encrypt_date = Some(re_encrypt_at);
                })?;
                Ok(FileAvailability {
                    status: FileStatusKind::Retrieving,
                    eta,
                })
            }
        }
    }

    /// Returns the local path a download can stream, decrypting the hot copy in place first
    /// when needed.
    pub async fn prepare_download(
        &self,
        project: &str,
        filename: &str,
    ) -> Result<std::path::PathBuf, EngineError> {
        let inner = &self.inner;
        let file = inner
            .catalog
            .find_file(project, filename)
            .ok_or_else(|| EngineError::FileNotFound {
                project: project.to_string(),
                filename: filename.to_string(),
            })?;

        if !file.expired_local {
            let path = file.storage_path(&inner.config.files_dir());
            if file.encrypted {
                let keys = inner.encryption.clone();
                let decrypt_path = path.clone();
                tokio::task::spawn_blocking(move || {
                    envelope::decrypt_file_in_place(&decrypt_path, |name| keys.lookup(name))
                })
                .await
                .map_err(|join_error| EngineError::Io(std::io::Error::other(join_error)))??;

                let re_encrypt_at = Utc::now() + delta(inner.tuning.re_encrypt_delay);
                inner.catalog.update_file(project, filename, |file| {
                    file.encrypted = false;
                    file.re_encrypt_date = Some(re_encrypt_at);
                })?;
                inner.log.info(
                    project,
                    format!("'{}' decrypted for download", file.path),
                );
            }
            return Ok(path);
        }

        file.retrieved_path
            .clone()
            .ok_or_else(|| EngineError::NotAvailable(file.path.clone()))
    }

    /// Starts pushing an available file to a configured destination.
    pub async fn push_file(
        &self,
        project: &str,
        filename: &str,
        destination: &str,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        let destination = inner
            .config
            .push_destinations
            .iter()
            .find(|config| config.name == destination)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDestination(destination.to_string()))?;

        let source = self.prepare_download(project, filename).await?;
        let file = inner
            .catalog
            .find_file(project, filename)
            .ok_or_else(|| EngineError::FileNotFound {
                project: project.to_string(),
                filename: filename.to_string(),
            })?;
        let handle = spawn_pusher(destination.clone(), source, file.path.clone());
        inner.catalog.update_file(project, filename, |file| {
            file.pushers.insert(destination.name.clone(), handle);
        })?;
        Ok(())
    }

    /// Progress of all pushes of a file.
    pub fn push_status(
        &self,
        project: &str,
        filename: &str,
    ) -> Result<Vec<PushStatusEntry>, EngineError> {
        let file = self
            .inner
            .catalog
            .find_file(project, filename)
            .ok_or_else(|| EngineError::FileNotFound {
                project: project.to_string(),
                filename: filename.to_string(),
            })?;
        Ok(file
            .pushers
            .values()
            .map(|handle| {
                let (copied, total) = handle.progress();
                PushStatusEntry {
                    destination: handle.destination().to_string(),
                    finished: handle.is_finished(),
                    error: handle.error(),
                    eta: handle.eta(),
                    copied,
                    total,
                }
            })
            .collect())
    }

    /// Encrypts due files back into envelopes, one at a time.
    pub async fn re_encrypt_due_files(&self) {
        let inner = &self.inner;
        let Some((key_name, key)) = inner.encryption.default_key() else {
            return;
        };
        while let Some(candidate) = inner.catalog.next_re_encrypt_candidate(Utc::now()) {
            let result = inner
                .encrypter
                .submit(
                    candidate.local_path.clone(),
                    key_name.to_string(),
                    key,
                    format!("{}/{}", candidate.project, candidate.filename),
                )
                .await;
            match result {
                Ok(()) => {
                    if let Err(error) = inner
                        .catalog
                        .mark_re_encrypted(&candidate.project, &candidate.filename)
                    {
                        inner.log.error(
                            &candidate.project,
                            format!("error recording re-encryption: {error}"),
                        );
                        return;
                    }
                    inner.log.success(
                        &candidate.project,
                        format!("'{}' re-encrypted", candidate.local_path.display()),
                    );
                }
                Err(error) => {
                    // Left as-is; the next pass retries this file.
                    inner.log.error(
                        &candidate.project,
                        format!(
                            "error re-encrypting '{}': {error}",
                            candidate.local_path.display()
                        ),
                    );
                    return;
                }
            }
        }
    }

    /// Writes the catalog and the API-key store into the self-backup container.
    pub async fn self_backup(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let Some(container) = inner.config.self_backup_container.as_deref() else {
            return Ok(());
        };

        let mut catalog_bytes = Vec::new();
        inner.catalog.save_to_writer(&mut catalog_bytes)?;
        inner
            .store
            .file_put_content(container, ".barry/projects.db", catalog_bytes)
            .await?;

        let mut keys_bytes = Vec::new();
        inner.api_keys.save_to_writer(&mut keys_bytes)?;
        inner
            .store
            .file_put_content(container, ".barry/api-keys.db", keys_bytes)
            .await?;

        inner.log.info_global("self-backup completed");
        Ok(())
    }

    /// Downloads the self-backed-up metadata back to the local data directory.
    ///
    /// One-shot, invoked by `barryd self-restore`; the daemon must not be running.
    pub async fn self_restore(
        config: &AppConfig,
        store: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<()> {
        let container = config
            .self_backup_container
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no self_backup_container configured"))?;

        let catalog_bytes = store
            .file_get_content(container, ".barry/projects.db")
            .await?;
        barry_core::fsutil::write_private_atomic(&config.catalog_path(), &catalog_bytes)?;

        let keys_bytes = store
            .file_get_content(container, ".barry/api-keys.db")
            .await?;
        barry_core::fsutil::write_private_atomic(&config.api_keys_path(), &keys_bytes)?;

        tracing::info!("catalog and API keys restored from self-backup");
        Ok(())
    }

    /// Daemon status summary.
    pub fn status(&self) -> ServerStatus {
        let inner = &self.inner;
        let stats = inner.catalog.stats();
        ServerStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: inner.started_at.elapsed().as_secs(),
            queue_size: inner.queue_size.load(Ordering::Relaxed),
            projects: stats.projects,
            files: stats.files,
            total_size: stats.total_size,
            total_cost: stats.total_cost,
            uploaders: inner.uploader.statuses(),
            encrypters: inner.encrypter.statuses(),
        }
    }

    /// The project/file catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    /// The wait list (exposed for the scan loop and tests).
    pub fn wait_list(&self) -> &Arc<WaitList> {
        &self.inner.wait_list
    }

    /// The API-key store.
    pub fn api_keys(&self) -> &Arc<ApiKeyStore> {
        &self.inner.api_keys
    }

    /// The daemon configuration.
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// The logging handle.
    pub fn log(&self) -> &Log {
        &self.inner.log
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

async fn has_envelope_magic(path: &std::path::Path) -> std::io::Result<bool> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; envelope::MAGIC.len()];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(&magic == envelope::MAGIC),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(error) => Err(error),
    }
}

