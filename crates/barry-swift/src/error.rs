// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Object-store error types.

/// Result alias for object-store operations.
pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Error returned by object-store operations.
///
/// [`ObjectStoreError::NotFound`] is the only variant callers treat as non-retryable; every
/// other failure is transient from the daemon's point of view and handled by its coarse retry
/// loops.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// The object (or its manifest) does not exist.
    #[error("object '{container}/{path}' not found")]
    NotFound {
        /// Container queried.
        container: String,
        /// Object path within the container.
        path: String,
    },
    /// A required container does not exist.
    #[error("container '{0}' not found (it must be created beforehand)")]
    ContainerNotFound(String),
    /// Authenticating against the store failed.
    #[error("object store authentication failed: {0}")]
    Auth(String),
    /// The HTTP transport failed.
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The store answered with a status the adapter does not expect.
    #[error("unexpected status {status} while {context}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// What the adapter was doing.
        context: String,
    },
    /// Reading the local source or sink failed.
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The provider reported an availability state the adapter does not know.
    #[error("unknown object availability state '{0}'")]
    UnknownAvailability(String),
}

impl ObjectStoreError {
    /// True iff the error means the object is definitively absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::NotFound { .. } | ObjectStoreError::ContainerNotFound(_)
        )
    }
}
