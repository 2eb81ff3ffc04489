// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded worker pools for uploads and encryption.
//!
//! A pool owns a fixed number of tokio tasks reading from a tight job channel; each job carries
//! a one-shot result channel. Submission awaits channel capacity, so a full pool pushes back on
//! producers instead of queueing unboundedly. Every worker publishes a status string for
//! operator observability.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use barry_core::envelope::{self, EnvelopeError, Key};
use barry_swift::{ObjectStore, ObjectStoreError};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::catalog::BackupFile;

/// Per-worker status strings, indexed by worker id.
#[derive(Debug)]
pub struct StatusBoard {
    slots: Mutex<Vec<String>>,
}

impl StatusBoard {
    fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec!["idle".to_string(); workers]),
        })
    }

    fn set(&self, worker: usize, status: impl Into<String>) {
        let mut slots = self.slots.lock().expect("status board lock poisoned");
        if let Some(slot) = slots.get_mut(worker) {
            *slot = status.into();
        }
    }

    /// Snapshot of all worker statuses.
    pub fn snapshot(&self) -> Vec<String> {
        self.slots.lock().expect("status board lock poisoned").clone()
    }
}

/// A single upload request handed to the pool.
#[derive(Debug)]
pub struct UploadJob {
    /// Project the file belongs to.
    pub project: String,
    /// The file to upload; `container`, `path` and `expire_remote` drive the request.
    pub file: BackupFile,
    /// Attempt counter, for observability.
    pub tries: u32,
    /// Timestamp of the last attempt.
    pub last_try: Option<DateTime<Utc>>,
    /// One-shot result channel.
    pub result: oneshot::Sender<Result<(), ObjectStoreError>>,
}

/// Pool of workers pushing queue files into the object store.
#[derive(Debug, Clone)]
pub struct Uploader {
    jobs: mpsc::Sender<UploadJob>,
    board: Arc<StatusBoard>,
}

impl Uploader {
    /// Starts `workers` upload tasks reading files below `queue_path`.
    pub fn start(workers: usize, store: Arc<dyn ObjectStore>, queue_path: PathBuf) -> Self {
        let (jobs, rx) = mpsc::channel::<UploadJob>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let board = StatusBoard::new(workers);

        for id in 0..workers {
            let rx = rx.clone();
            let store = store.clone();
            let queue_path = queue_path.clone();
            let board = board.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(mut job) = job else {
                        return;
                    };

                    job.tries += 1;
                    job.last_try = Some(Utc::now());
                    board.set(id, format!("uploading {} (try {})", job.file.path, job.tries));
                    tracing::debug!(worker = id, path = %job.file.path, "upload worker picked a job");

                    let source = queue_path.join(&job.file.path);
                    let delete_after = (job.file.expire_remote - Utc::now())
                        .to_std()
                        .ok()
                        .filter(|eta| *eta > Duration::ZERO);
                    let result = store
                        .upload(&job.file.container, &job.file.path, &source, delete_after)
                        .await;

                    board.set(id, "idle");
                    // The submitter may have given up; a dropped receiver is not an error.
                    let _ = job.result.send(result);
                }
            });
        }

        Self { jobs, board }
    }

    /// Submits a job, awaiting channel capacity (backpressure when all workers are busy).
    pub async fn submit(
        &self,
        project: String,
        file: BackupFile,
    ) -> Result<(), ObjectStoreError> {
        let (tx, rx) = oneshot::channel();
        let job = UploadJob {
            project,
            file,
            tries: 0,
            last_try: None,
            result: tx,
        };
        self.jobs
            .send(job)
            .await
            .map_err(|_| ObjectStoreError::Io(std::io::Error::other("upload pool stopped")))?;
        rx.await
            .map_err(|_| ObjectStoreError::Io(std::io::Error::other("upload worker vanished")))?
    }

    /// Worker statuses for the server status endpoint.
    pub fn statuses(&self) -> Vec<String> {
        self.board.snapshot()
    }
}

/// A single in-place encryption request.
#[derive(Debug)]
pub struct EncryptJob {
    /// File to encrypt in place.
    pub path: PathBuf,
    /// Key name recorded in the envelope header.
    pub key_name: String,
    /// The key itself.
    pub key: Key,
    /// Envelope comment.
    pub comment: String,
    /// One-shot result channel.
    pub result: oneshot::Sender<Result<(), EnvelopeError>>,
}

/// Pool of workers encrypting files in place.
#[derive(Debug, Clone)]
pub struct Encrypter {
    jobs: mpsc::Sender<EncryptJob>,
    board: Arc<StatusBoard>,
}

impl Encrypter {
    /// Starts `workers` encryption tasks.
    pub fn start(workers: usize) -> Self {
        let (jobs, rx) = mpsc::channel::<EncryptJob>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let board = StatusBoard::new(workers);

        for id in 0..workers {
            let rx = rx.clone();
            let board = board.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        return;
                    };

                    board.set(id, format!("encrypting {}", job.path.display()));
                    let EncryptJob {
                        path,
                        key_name,
                        key,
                        comment,
                        result,
                    } = job;
                    let outcome = tokio::task::spawn_blocking(move || {
                        envelope::encrypt_file_in_place(&path, &key_name, &key, &comment)
                    })
                    .await
                    .unwrap_or_else(|join_error| {
                        Err(EnvelopeError::Io(std::io::Error::other(join_error)))
                    });

                    board.set(id, "idle");
                    let _ = result.send(outcome);
                }
            });
        }

        Self { jobs, board }
    }

    /// Submits a job, awaiting channel capacity.
    pub async fn submit(
        &self,
        path: PathBuf,
        key_name: String,
        key: Key,
        comment: String,
    ) -> Result<(), EnvelopeError> {
        let (tx, rx) = oneshot::channel();
        let job = EncryptJob {
            path,
            key_name,
            key,
            comment,
            result: tx,
        };
        self.jobs
            .send(job)
            .await
            .map_err(|_| EnvelopeError::Io(std::io::Error::other("encrypter pool stopped")))?;
        rx.await
            .map_err(|_| EnvelopeError::Io(std::io::Error::other("encrypt worker vanished")))?
    }

    /// Worker statuses for the server status endpoint.
    pub fn statuses(&self) -> Vec<String> {
        self.board.snapshot()
    }
}
