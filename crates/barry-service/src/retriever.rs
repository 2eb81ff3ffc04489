// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Streaming rehydration of cold objects back to local disk.
//!
//! A retriever is a transient handle stored on the file record while the copy is in flight.
//! The engine polls it from the availability state machine; once it reports finished, the
//! destination path is promoted to the record's `retrieved_path` and the handle is dropped.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use barry_core::envelope::{self, Key};
use barry_swift::ObjectStore;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

/// Progress shared between a transfer task and the handles observing it.
#[derive(Debug)]
pub(crate) struct TransferState {
    pub total: u64,
    pub copied: u64,
    pub started: Instant,
    pub finished: bool,
    pub error: Option<String>,
}

impl TransferState {
    pub(crate) fn new() -> Self {
        Self {
            total: 0,
            copied: 0,
            started: Instant::now(),
            finished: false,
            error: None,
        }
    }

    /// Remaining-time estimate extrapolated from the observed throughput.
    pub(crate) fn eta(&self) -> Duration {
        if self.finished {
            return Duration::ZERO;
        }
        if self.copied == 0 || self.total == 0 {
            return Duration::from_secs(60);
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = self.total.saturating_sub(self.copied) as f64;
        Duration::from_secs_f64(elapsed * remaining / self.copied as f64)
    }
}

/// Handle on an in-flight (or finished) retrieval.
#[derive(Debug, Clone)]
pub struct RetrieverHandle {
    state: Arc<Mutex<TransferState>>,
    dest: PathBuf,
    decrypts: bool,
}

impl RetrieverHandle {
    /// Whether the transfer has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.state.lock().expect("retriever lock poisoned").finished
    }

    /// The error message, if the transfer failed.
    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("retriever lock poisoned")
            .error
            .clone()
    }

    /// Remaining-time estimate.
    pub fn eta(&self) -> Duration {
        self.state.lock().expect("retriever lock poisoned").eta()
    }

    /// `(copied, total)` byte counts.
    pub fn progress(&self) -> (u64, u64) {
        let state = self.state.lock().expect("retriever lock poisoned");
        (state.copied, state.total)
    }

    /// Where the retrieved copy lands.
    pub fn destination(&self) -> &PathBuf {
        &self.dest
    }

    /// Whether the retrieved copy was decrypted to plaintext.
    pub fn decrypts(&self) -> bool {
        self.decrypts
    }
}

/// Starts a retrieval of `container/object_path` into `dest`.
///
/// The object streams into a dot-prefixed sibling of `dest` first. If it turns out to be an
/// encryption envelope and `key_lookup` is provided, it is decrypted in place before the final
/// rename, so `dest` only ever appears complete.
pub fn spawn_retriever(
    store: Arc<dyn ObjectStore>,
    container: String,
    object_path: String,
    dest: PathBuf,
    key_lookup: Option<Arc<dyn Fn(&str) -> Option<Key> + Send + Sync>>,
) -> RetrieverHandle {
    let state = Arc::new(Mutex::new(TransferState::new()));
    let handle = RetrieverHandle {
        state: state.clone(),
        dest: dest.clone(),
        decrypts: key_lookup.is_some(),
    };

    tokio::spawn(async move {
        let result = retrieve(store, &container, &object_path, &dest, key_lookup, &state).await;
        let mut state = state.lock().expect("retriever lock poisoned");
        state.finished = true;
        if let Err(error) = result {
            tracing::warn!(object = %object_path, %error, "retrieval failed");
            state.error = Some(error.to_string());
        }
    });

    handle
}

async fn retrieve(
    store: Arc<dyn ObjectStore>,
    container: &str,
    object_path: &str,
    dest: &PathBuf,
    key_lookup: Option<Arc<dyn Fn(&str) -> Option<Key> + Send + Sync>>,
    state: &Arc<Mutex<TransferState>>,
) -> anyhow::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("retrieval destination has no parent directory"))?;
    tokio::fs::create_dir_all(parent).await?;

    let filename = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("retrieval destination has no file name"))?;
    let partial = parent.join(format!(".barry-retrieve-{filename}"));

    let mut open = store.object_open(container, object_path).await?;
    state.lock().expect("retriever lock poisoned").total = open.size;

    let mut output = tokio::fs::File::create(&partial).await?;
    while let Some(chunk) = open.stream.next().await {
        let chunk = chunk?;
        output.write_all(&chunk).await?;
        state.lock().expect("retriever lock poisoned").copied += chunk.len() as u64;
    }
    output.flush().await?;
    drop(output);

    if let Some(lookup) = key_lookup {
        if is_envelope(&partial).await? {
            let partial_clone = partial.clone();
            tokio::task::spawn_blocking(move || {
                envelope::decrypt_file_in_place(&partial_clone, |name| lookup(name))
            })
            .await??;
        }
    }

    tokio::fs::rename(&partial, dest).await?;
    tracing::info!(object = %object_path, dest = %dest.display(), "retrieval complete");
    Ok(())
}

async fn is_envelope(path: &PathBuf) -> std::io::Result<bool> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; envelope::MAGIC.len()];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(&magic == envelope::MAGIC),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, time::Duration};

    use barry_swift::{test_utils::MemoryObjectStore, AvailabilityState};
    use barry_test_utils::wait_until;

    use super::*;

    #[tokio::test]
    async fn retrieves_plain_object() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("retrieved/proj/a.tar");
        let store = MemoryObjectStore::with_containers(["cold"]);
        store.insert_object("cold", "proj/a.tar", b"payload".to_vec(), AvailabilityState::Unsealed);

        let handle = spawn_retriever(
            Arc::new(store),
            "cold".to_string(),
            "proj/a.tar".to_string(),
            dest.clone(),
            None,
        );

        assert!(wait_until(Duration::from_secs(5), || async { handle.is_finished() }).await);
        assert_eq!(handle.error(), None);
        assert_eq!(std::fs::read(&dest)?, b"payload");
        assert_eq!(handle.progress(), (7, 7));
        assert_eq!(handle.eta(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn decrypts_envelopes_when_keys_are_available() -> barry_test_utils::Result {
        const KEY: Key = [5u8; 32];

        let mut envelope_bytes = Vec::new();
        envelope::encrypt(
            &mut Cursor::new(b"secret payload".to_vec()),
            &mut envelope_bytes,
            "default",
            &KEY,
            "",
        )?;

        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("retrieved/proj/a.tar");
        let store = MemoryObjectStore::with_containers(["cold"]);
        store.insert_object("cold", "proj/a.tar", envelope_bytes, AvailabilityState::Unsealed);

        let handle = spawn_retriever(
            Arc::new(store),
            "cold".to_string(),
            "proj/a.tar".to_string(),
            dest.clone(),
            Some(Arc::new(|name: &str| (name == "default").then_some(KEY))),
        );

        assert!(wait_until(Duration::from_secs(5), || async { handle.is_finished() }).await);
        assert_eq!(handle.error(), None);
        assert_eq!(std::fs::read(&dest)?, b"secret payload");
        Ok(())
    }

    #[tokio::test]
    async fn reports_errors_for_missing_objects() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let store = MemoryObjectStore::with_containers(["cold"]);

        let handle = spawn_retriever(
            Arc::new(store),
            "cold".to_string(),
            "proj/missing".to_string(),
            dir.path().join("retrieved/proj/missing"),
            None,
        );

        assert!(wait_until(Duration::from_secs(5), || async { handle.is_finished() }).await);
        assert!(handle.error().is_some());
        Ok(())
    }
}
