// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The [`ObjectStore`] trait and its Swift HTTP implementation.
//!
//! Large objects are stored as numbered segments in a `<container>_segments` companion
//! container plus a manifest object in the main container, so both containers must exist before
//! any upload. Cold providers report per-object availability (sealed, unsealing, unsealed) via
//! response headers; providers without those headers are treated as unsealed once the
//! manifest's segments are visible.

use std::{fmt, path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::{Body, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::{
    config::SwiftConfig,
    error::{ObjectStoreError, ObjectStoreResult},
};

/// Availability header used by cold-storage providers.
const RETRIEVAL_STATE_HEADER: &str = "x-ovh-retrieval-state";
/// ETA header accompanying [`RETRIEVAL_STATE_HEADER`].
const RETRIEVAL_DELAY_HEADER: &str = "x-ovh-retrieval-delay";

/// Grace ETA reported while a provider without state headers still hides the segments.
const SEGMENT_VISIBILITY_GRACE: Duration = Duration::from_secs(30);

/// Provider-reported availability of a cold object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    /// The object is in cold storage and must be unsealed before reading.
    Sealed,
    /// An unseal is in progress.
    Unsealing,
    /// The object can be opened.
    Unsealed,
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AvailabilityState::Sealed => "sealed",
            AvailabilityState::Unsealing => "unsealing",
            AvailabilityState::Unsealed => "unsealed",
        };
        write!(f, "{name}")
    }
}

/// Availability state plus the provider-reported ETA until the object is readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    /// The reported state.
    pub state: AvailabilityState,
    /// Seconds until the object becomes readable; zero when already unsealed.
    pub eta: Duration,
}

/// An opened (unsealed) object: its total size and a byte stream.
pub struct OpenObject {
    /// Object size in bytes.
    pub size: u64,
    /// The object's content.
    pub stream: BoxStream<'static, ObjectStoreResult<Bytes>>,
}

impl fmt::Debug for OpenObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Capabilities the lifecycle engine requires from a cold object store.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Verifies that `container` and its `_segments` companion exist.
    async fn check_container(&self, container: &str) -> ObjectStoreResult<()>;

    /// Uploads the file at `source` as a chunked large object.
    ///
    /// When `delete_after` is set, the provider is asked to expire the object on its own once
    /// that duration has elapsed.
    async fn upload(
        &self,
        container: &str,
        object_path: &str,
        source: &Path,
        delete_after: Option<Duration>,
    ) -> ObjectStoreResult<()>;

    /// Deletes the object's manifest and all its segments.
    async fn delete(&self, container: &str, object_path: &str) -> ObjectStoreResult<()>;

    /// Opens an unsealed object for streaming reads.
    async fn object_open(&self, container: &str, object_path: &str)
        -> ObjectStoreResult<OpenObject>;

    /// Reports the availability of the object.
    async fn get_object_availability(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Availability>;

    /// Requests an unseal and returns the provider ETA (zero if already unsealed).
    async fn unseal(&self, container: &str, object_path: &str) -> ObjectStoreResult<Duration>;

    /// Writes a small object in one request.
    async fn file_put_content(
        &self,
        container: &str,
        object_path: &str,
        content: Vec<u8>,
    ) -> ObjectStoreResult<()>;

    /// Reads a small object in one request.
    async fn file_get_content(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct AuthState {
    storage_url: String,
    token: String,
}

/// [`ObjectStore`] implementation speaking the Swift HTTP API.
#[derive(Debug)]
pub struct SwiftClient {
    config: SwiftConfig,
    http: reqwest::Client,
    auth: tokio::sync::Mutex<Option<AuthState>>,
}

impl SwiftClient {
    /// Creates a client; the first request triggers authentication.
    pub fn new(config: SwiftConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            auth: tokio::sync::Mutex::new(None),
        }
    }

    /// Authenticates eagerly, so configuration errors surface at startup.
    pub async fn connect(&self) -> ObjectStoreResult<()> {
        self.auth_state().await.map(|_| ())
    }

    async fn auth_state(&self) -> ObjectStoreResult<AuthState> {
        let mut auth = self.auth.lock().await;
        if let Some(state) = auth.as_ref() {
            return Ok(state.clone());
        }

        let response = self
            .http
            .get(&self.config.auth_url)
            .header("X-Auth-User", &self.config.username)
            .header("X-Auth-Key", &self.config.api_key)
            .header("X-Auth-Domain", &self.config.domain)
            .header("X-Auth-Region", &self.config.region)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ObjectStoreError::Auth(format!(
                "authentication endpoint answered {}",
                response.status()
            )));
        }

        let header = |name: &str| -> ObjectStoreResult<String> {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    ObjectStoreError::Auth(format!("missing '{name}' header in auth response"))
                })
        };
        let state = AuthState {
            storage_url: header("X-Storage-Url")?.trim_end_matches('/').to_string(),
            token: header("X-Auth-Token")?,
        };
        tracing::debug!(storage_url = %state.storage_url, "authenticated with object store");
        *auth = Some(state.clone());
        Ok(state)
    }

    async fn forget_auth(&self) {
        *self.auth.lock().await = None;
    }

    fn object_url(auth: &AuthState, container: &str, object_path: &str) -> String {
        format!("{}/{container}/{object_path}", auth.storage_url)
    }

    fn segments_container(container: &str) -> String {
        format!("{container}_segments")
    }

    /// Sends `build(auth)` and retries once after re-authenticating on 401.
    async fn send_authed<F>(&self, build: F) -> ObjectStoreResult<Response>
    where
        F: Fn(&AuthState) -> reqwest::RequestBuilder,
    {
        let auth = self.auth_state().await?;
        let response = build(&auth)
            .header("X-Auth-Token", &auth.token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.forget_auth().await;
        let auth = self.auth_state().await?;
        Ok(build(&auth)
            .header("X-Auth-Token", &auth.token)
            .send()
            .await?)
    }

    /// Lists the segment object names backing `object_path`, oldest segment first.
    async fn list_segments(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Vec<String>> {
        let segments_container = Self::segments_container(container);
        let response = self
            .send_authed(|auth| {
                self.http
                    .get(format!("{}/{segments_container}", auth.storage_url))
                    .query(&[("prefix", format!("{object_path}/"))])
            })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let listing = response.text().await?;
                let mut names: Vec<String> =
                    listing.lines().map(str::to_string).collect();
                names.sort();
                Ok(names)
            }
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::ContainerNotFound(segments_container)),
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("listing segments of '{container}/{object_path}'"),
            }),
        }
    }

    async fn upload_segment(
        &self,
        container: &str,
        object_path: &str,
        source: &Path,
        index: u64,
        offset: u64,
        len: u64,
    ) -> ObjectStoreResult<()> {
        let segments_container = Self::segments_container(container);
        let segment_name = format!("{object_path}/{index:08}");

        // The streamed body cannot be replayed, so the 401 retry rebuilds it from the file
        // instead of going through `send_authed`.
        for attempt in 0..2 {
            let auth = self.auth_state().await?;
            let mut file = tokio::fs::File::open(source).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let body = Body::wrap_stream(ReaderStream::new(file.take(len)));

            let response = self
                .http
                .put(format!(
                    "{}/{segments_container}/{segment_name}",
                    auth.storage_url
                ))
                .header("X-Auth-Token", &auth.token)
                .header("Content-Length", len)
                .body(body)
                .send()
                .await?;

            match response.status() {
                StatusCode::UNAUTHORIZED if attempt == 0 => {
                    self.forget_auth().await;
                }
                status if status.is_success() => return Ok(()),
                StatusCode::NOT_FOUND => {
                    return Err(ObjectStoreError::ContainerNotFound(segments_container));
                }
                status => {
                    return Err(ObjectStoreError::UnexpectedStatus {
                        status: status.as_u16(),
                        context: format!(
                            "uploading segment {index} of '{container}/{object_path}'"
                        ),
                    });
                }
            }
        }
        Err(ObjectStoreError::Auth(
            "token rejected twice in a row".to_string(),
        ))
    }
}

#[async_trait]
impl ObjectStore for SwiftClient {
    async fn check_container(&self, container: &str) -> ObjectStoreResult<()> {
        for name in [container.to_string(), Self::segments_container(container)] {
            let response = self
                .send_authed(|auth| self.http.head(format!("{}/{name}", auth.storage_url)))
                .await?;
            match response.status() {
                status if status.is_success() => {}
                StatusCode::NOT_FOUND => {
                    return Err(ObjectStoreError::ContainerNotFound(name));
                }
                status => {
                    return Err(ObjectStoreError::UnexpectedStatus {
                        status: status.as_u16(),
                        context: format!("checking container '{name}'"),
                    });
                }
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        container: &str,
        object_path: &str,
        source: &Path,
        delete_after: Option<Duration>,
    ) -> ObjectStoreResult<()> {
        let size = tokio::fs::metadata(source).await?.len();
        let chunk_size = self.config.chunk_size;

        let mut offset = 0;
        let mut index = 0;
        while offset < size {
            let len = chunk_size.min(size - offset);
            self.upload_segment(container, object_path, source, index, offset, len)
                .await?;
            offset += len;
            index += 1;
        }

        // The manifest makes the segments readable as one object.
        let manifest_prefix = format!("{}/{object_path}/", Self::segments_container(container));
        let response = self
            .send_authed(|auth| {
                let mut request = self
                    .http
                    .put(Self::object_url(auth, container, object_path))
                    .header("X-Object-Manifest", &manifest_prefix)
                    .header("Content-Length", 0u64);
                if let Some(delete_after) = delete_after {
                    request = request.header("X-Delete-After", delete_after.as_secs());
                }
                request
            })
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                Err(ObjectStoreError::ContainerNotFound(container.to_string()))
            }
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("writing manifest '{container}/{object_path}'"),
            }),
        }
    }

    async fn delete(&self, container: &str, object_path: &str) -> ObjectStoreResult<()> {
        let mut found_any = false;

        for segment in self.list_segments(container, object_path).await? {
            found_any = true;
            let segments_container = Self::segments_container(container);
            let response = self
                .send_authed(|auth| {
                    self.http.delete(format!(
                        "{}/{segments_container}/{segment}",
                        auth.storage_url
                    ))
                })
                .await?;
            if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
                return Err(ObjectStoreError::UnexpectedStatus {
                    status: response.status().as_u16(),
                    context: format!("deleting segment '{segment}' of '{container}/{object_path}'"),
                });
            }
        }

        let response = self
            .send_authed(|auth| {
                self.http
                    .delete(Self::object_url(auth, container, object_path))
            })
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND if !found_any => Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                path: object_path.to_string(),
            }),
            // The manifest can legitimately be gone while stale segments remained.
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("deleting manifest '{container}/{object_path}'"),
            }),
        }
    }

    async fn object_open(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<OpenObject> {
        let response = self
            .send_authed(|auth| self.http.get(Self::object_url(auth, container, object_path)))
            .await?;

        match response.status() {
            status if status.is_success() => {
                let size = response.content_length().unwrap_or(0);
                let stream = Box::pin(futures::StreamExt::map(response.bytes_stream(), |chunk| {
                    chunk.map_err(ObjectStoreError::from)
                }));
                Ok(OpenObject { size, stream })
            }
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                path: object_path.to_string(),
            }),
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("opening '{container}/{object_path}'"),
            }),
        }
    }

    async fn get_object_availability(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Availability> {
        let response = self
            .send_authed(|auth| {
                self.http
                    .head(Self::object_url(auth, container, object_path))
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                path: object_path.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ObjectStoreError::UnexpectedStatus {
                status: response.status().as_u16(),
                context: format!("querying availability of '{container}/{object_path}'"),
            });
        }

        let eta = response
            .headers()
            .get(RETRIEVAL_DELAY_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);

        match response
            .headers()
            .get(RETRIEVAL_STATE_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            Some("sealed") => Ok(Availability {
                state: AvailabilityState::Sealed,
                eta,
            }),
            Some("unsealing") => Ok(Availability {
                state: AvailabilityState::Unsealing,
                eta,
            }),
            Some("unsealed") | Some("") => Ok(Availability {
                state: AvailabilityState::Unsealed,
                eta: Duration::ZERO,
            }),
            Some(other) => Err(ObjectStoreError::UnknownAvailability(other.to_string())),
            // No state header: the provider has no sealing model. The object is readable once
            // its segments are visible in the listing.
            None => {
                if self.list_segments(container, object_path).await?.is_empty() {
                    Ok(Availability {
                        state: AvailabilityState::Unsealing,
                        eta: SEGMENT_VISIBILITY_GRACE,
                    })
                } else {
                    Ok(Availability {
                        state: AvailabilityState::Unsealed,
                        eta: Duration::ZERO,
                    })
                }
            }
        }
    }

    async fn unseal(&self, container: &str, object_path: &str) -> ObjectStoreResult<Duration> {
        let response = self
            .send_authed(|auth| self.http.get(Self::object_url(auth, container, object_path)))
            .await?;

        match response.status() {
            // Readable already; discard the body.
            status if status.is_success() => Ok(Duration::ZERO),
            // Cold providers answer the first read of a sealed object with a throttle carrying
            // the unseal delay.
            StatusCode::TOO_MANY_REQUESTS => {
                let eta = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .map(Duration::from_secs);
                match eta {
                    Some(eta) => Ok(eta),
                    None => Ok(self
                        .get_object_availability(container, object_path)
                        .await?
                        .eta),
                }
            }
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                path: object_path.to_string(),
            }),
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("unsealing '{container}/{object_path}'"),
            }),
        }
    }

    async fn file_put_content(
        &self,
        container: &str,
        object_path: &str,
        content: Vec<u8>,
    ) -> ObjectStoreResult<()> {
        let response = self
            .send_authed(|auth| {
                self.http
                    .put(Self::object_url(auth, container, object_path))
                    .body(content.clone())
            })
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                Err(ObjectStoreError::ContainerNotFound(container.to_string()))
            }
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("writing '{container}/{object_path}'"),
            }),
        }
    }

    async fn file_get_content(
        &self,
        container: &str,
        object_path: &str,
    ) -> ObjectStoreResult<Vec<u8>> {
        let response = self
            .send_authed(|auth| self.http.get(Self::object_url(auth, container, object_path)))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                path: object_path.to_string(),
            }),
            status => Err(ObjectStoreError::UnexpectedStatus {
                status: status.as_u16(),
                context: format!("reading '{container}/{object_path}'"),
            }),
        }
    }
}
