// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`ObjectStore`] used by unit and integration tests.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    client::{Availability, AvailabilityState, ObjectStore, OpenObject},
    error::{ObjectStoreError, ObjectStoreResult},
};

#[derive(Debug, Clone)]
struct StoredObject {
    content: Vec<u8>,
    state: AvailabilityState,
    unseal_eta: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashSet<String>,
    objects: HashMap<(String, String), StoredObject>,
    upload_failures: u32,
    upload_count: u64,
}

/// An in-memory object store with scriptable availability and failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    /// Creates an empty store with the given containers pre-created.
    pub fn with_containers(containers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.lock().unwrap();
            for container in containers {
                let container = container.into();
                inner.containers.insert(format!("{container}_segments"));
                inner.containers.insert(container);
            }
        }
        store
    }

    /// Returns the stored bytes of an object, if present.
    pub fn object(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(container.to_string(), path.to_string()))
            .map(|object| object.content.clone())
    }

    /// Number of successful uploads so far.
    pub fn upload_count(&self) -> u64 {
        self.inner.lock().unwrap().upload_count
    }

    /// Makes the next `count` uploads fail with an I/O error.
    pub fn fail_next_uploads(&self, count: u32) {
        self.inner.lock().unwrap().upload_failures = count;
    }

    /// Forces an object into the given availability state.
    pub fn set_availability(&self, container: &str, path: &str, state: AvailabilityState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(object) = inner
            .objects
            .get_mut(&(container.to_string(), path.to_string()))
        {
            object.state = state;
        }
    }

    /// Sets the ETA reported while the object is sealed or unsealing.
    pub fn set_unseal_eta(&self, container: &str, path: &str, eta: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(object) = inner
            .objects
            .get_mut(&(container.to_string(), path.to_string()))
        {
            object.unseal_eta = eta;
        }
    }

    /// Directly inserts an object, bypassing the upload path.
    pub fn insert_object(
        &self,
        container: &str,
        path: &str,
        content: Vec<u8>,
        state: AvailabilityState,
    ) {
        self.inner.lock().unwrap().objects.insert(
            (container.to_string(), path.to_string()),
            StoredObject {
                content,
                state,
                unseal_eta: Duration::from_secs(600),
            },
        );
    }

    fn not_found(container: &str, path: &str) -> ObjectStoreError {
        ObjectStoreError::NotFound {
            container: container.to_string(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn check_container(&self, container: &str) -> ObjectStoreResult<()> {
        let inner = self.inner.lock().unwrap();
        for name in [container.to_string(), format!("{container}_segments")] {
            if !inner.containers.contains(&name) {
                return Err(ObjectStoreError::ContainerNotFound(name));
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        container: &str,
        object_path: &str,
        source: &Path,
        _delete_after: Option<Duration>,
    ) -> ObjectStoreResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.upload_failures > 0 {
                inner.upload_failures -= 1;
                return Err(ObjectStoreError::Io(std::io::Error::other(
                    "injected upload failure",
                )));
            }
        }

        let content = tokio::fs::read(source).await?;
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(
            (container.to_string(), object_path.to_string()),
            StoredObject {
                content,
                state: AvailabilityState::Unsealed,
                unseal_eta: Duration::ZERO,
            },
        );
        inner.upload_count += 1;
        Ok(())
    }

    async fn delete(&self, container: &str, object_path: &str) -> ObjectStoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .remove(&(container.to_string(), object_path.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(container, object_path))
    }

    async fn object_open(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<OpenObject> {
        let object = {
            let inner = self.inner.lock().unwrap();
            inner
                .objects
                .get(&(container.to_string(), object_path.to_string()))
                .cloned()
                .ok_or_else(|| Self::not_found(container, object_path))?
        };
        if object.state != AvailabilityState::Unsealed {
            return Err(ObjectStoreError::UnexpectedStatus {
                status: 429,
                context: format!("opening sealed object '{container}/{object_path}'"),
            });
        }

        let size = object.content.len() as u64;
        let chunks: Vec<ObjectStoreResult<Bytes>> = object
            .content
            .chunks(8 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(OpenObject {
            size,
            stream: Box::pin(futures::stream::iter(chunks)),
        })
    }

    async fn get_object_availability(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Availability> {
        let inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get(&(container.to_string(), object_path.to_string()))
            .ok_or_else(|| Self::not_found(container, object_path))?;
        Ok(Availability {
            state: object.state,
            eta: match object.state {
                AvailabilityState::Unsealed => Duration::ZERO,
                _ => object.unseal_eta,
            },
        })
    }

    async fn unseal(&self, container: &str, object_path: &str) -> ObjectStoreResult<Duration> {
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(&(container.to_string(), object_path.to_string()))
            .ok_or_else(|| Self::not_found(container, object_path))?;
        match object.state {
            AvailabilityState::Unsealed => Ok(Duration::ZERO),
            _ => {
                object.state = AvailabilityState::Unsealing;
                Ok(object.unseal_eta)
            }
        }
    }

    async fn file_put_content(
        &self,
        container: &str,
        object_path: &str,
        content: Vec<u8>,
    ) -> ObjectStoreResult<()> {
        self.inner.lock().unwrap().objects.insert(
            (container.to_string(), object_path.to_string()),
            StoredObject {
                content,
                state: AvailabilityState::Unsealed,
                unseal_eta: Duration::ZERO,
            },
        );
        Ok(())
    }

    async fn file_get_content(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Vec<u8>> {
        self.object(container, object_path)
            .ok_or_else(|| Self::not_found(container, object_path))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn upload_open_delete_roundtrip() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("artifact");
        tokio::fs::write(&source, b"payload").await?;

        let store = MemoryObjectStore::with_containers(["cold"]);
        store.check_container("cold").await?;
        store.upload("cold", "proj/artifact", &source, None).await?;

        let mut open = store.object_open("cold", "proj/artifact").await?;
        assert_eq!(open.size, 7);
        let mut content = Vec::new();
        while let Some(chunk) = open.stream.next().await {
            content.extend_from_slice(&chunk?);
        }
        assert_eq!(content, b"payload");

        store.delete("cold", "proj/artifact").await?;
        let error = store.delete("cold", "proj/artifact").await.unwrap_err();
        assert!(error.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn sealed_objects_unseal_through_states() -> barry_test_utils::Result {
        let store = MemoryObjectStore::with_containers(["cold"]);
        store.insert_object("cold", "p/f", vec![1, 2, 3], AvailabilityState::Sealed);

        let availability = store.get_object_availability("cold", "p/f").await?;
        assert_eq!(availability.state, AvailabilityState::Sealed);
        assert!(availability.eta > Duration::ZERO);

        let eta = store.unseal("cold", "p/f").await?;
        assert!(eta > Duration::ZERO);
        assert_eq!(
            store.get_object_availability("cold", "p/f").await?.state,
            AvailabilityState::Unsealing
        );

        store.set_availability("cold", "p/f", AvailabilityState::Unsealed);
        assert_eq!(store.unseal("cold", "p/f").await?, Duration::ZERO);
        Ok(())
    }
}
