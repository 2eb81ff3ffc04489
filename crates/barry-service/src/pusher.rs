// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Outbound pushes of available files to third-party destinations.
//!
//! Only the "push job" contract is modeled: a single authenticated streaming HTTP upload per
//! destination, with the same progress/ETA surface as retrievals. A file holds at most one
//! pusher per destination name.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use futures::TryStreamExt;
use tokio_util::io::ReaderStream;

use crate::{config::PushDestinationConfig, retriever::TransferState};

/// Handle on an in-flight (or finished) push.
#[derive(Debug, Clone)]
pub struct PusherHandle {
    state: Arc<Mutex<TransferState>>,
    destination: String,
}

impl PusherHandle {
    /// Name of the destination this push targets.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the push has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.state.lock().expect("pusher lock poisoned").finished
    }

    /// The error message, if the push failed.
    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("pusher lock poisoned")
            .error
            .clone()
    }

    /// Remaining-time estimate.
    pub fn eta(&self) -> std::time::Duration {
        self.state.lock().expect("pusher lock poisoned").eta()
    }

    /// `(copied, total)` byte counts.
    pub fn progress(&self) -> (u64, u64) {
        let state = self.state.lock().expect("pusher lock poisoned");
        (state.copied, state.total)
    }
}

/// Starts pushing the local file at `source` to `destination`.
pub fn spawn_pusher(
    destination: PushDestinationConfig,
    source: PathBuf,
    object_path: String,
) -> PusherHandle {
    let state = Arc::new(Mutex::new(TransferState::new()));
    let handle = PusherHandle {
        state: state.clone(),
        destination: destination.name.clone(),
    };

    tokio::spawn(async move {
        let result = push(&destination, &source, &object_path, &state).await;
        let mut state = state.lock().expect("pusher lock poisoned");
        state.finished = true;
        if let Err(error) = result {
            tracing::warn!(
                destination = %destination.name,
                path = %object_path,
                %error,
                "push failed"
            );
            state.error = Some(error.to_string());
        }
    });

    handle
}

async fn push(
    destination: &PushDestinationConfig,
    source: &PathBuf,
    object_path: &str,
    state: &Arc<Mutex<TransferState>>,
) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(source).await?;
    let total = file.metadata().await?.len();
    state.lock().expect("pusher lock poisoned").total = total;

    let progress = state.clone();
    let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
        progress.lock().expect("pusher lock poisoned").copied += chunk.len() as u64;
    });

    let url = format!(
        "{}/{}",
        destination.url.trim_end_matches('/'),
        object_path
    );
    let response = reqwest::Client::new()
        .put(&url)
        .header("X-Push-Key", &destination.key)
        .header("Content-Length", total)
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await?;

    anyhow::ensure!(
        response.status().is_success(),
        "push destination answered {}",
        response.status()
    );
    tracing::info!(destination = %destination.name, path = %object_path, "push complete");
    Ok(())
}
