// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Swift connection configuration.

use serde::{Deserialize, Serialize};

/// Smallest accepted upload chunk size (the large-object model requires real segments).
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Error returned when validating a [`SwiftConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SwiftConfigError {
    /// A mandatory setting is empty.
    #[error("swift {0} setting cannot be empty")]
    EmptySetting(&'static str),
    /// The chunk size is below [`MIN_CHUNK_SIZE`].
    #[error("chunk_size is too small ({0} bytes), use at least 1 MB")]
    ChunkSizeTooSmall(u64),
}

/// Connection settings for the Swift-style object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwiftConfig {
    /// Account user name.
    pub username: String,
    /// Account secret.
    pub api_key: String,
    /// Authentication endpoint handing out the storage URL and token.
    pub auth_url: String,
    /// Authentication domain.
    #[serde(default = "defaults::domain")]
    pub domain: String,
    /// Storage region.
    #[serde(default)]
    pub region: String,
    /// Segment size for large-object uploads, in bytes.
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: u64,
}

impl SwiftConfig {
    /// Checks that all mandatory settings are present and sane.
    pub fn validate(&self) -> Result<(), SwiftConfigError> {
        if self.username.is_empty() {
            return Err(SwiftConfigError::EmptySetting("username"));
        }
        if self.api_key.is_empty() {
            return Err(SwiftConfigError::EmptySetting("api_key"));
        }
        if self.auth_url.is_empty() {
            return Err(SwiftConfigError::EmptySetting("auth_url"));
        }
        if self.domain.is_empty() {
            return Err(SwiftConfigError::EmptySetting("domain"));
        }
        if self.region.is_empty() {
            return Err(SwiftConfigError::EmptySetting("region"));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(SwiftConfigError::ChunkSizeTooSmall(self.chunk_size));
        }
        Ok(())
    }
}

/// Swift configuration defaults.
pub mod defaults {
    /// Default authentication domain.
    pub fn domain() -> String {
        "Default".to_string()
    }

    /// Default segment size (512 MB).
    pub fn chunk_size() -> u64 {
        512 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SwiftConfig {
        SwiftConfig {
            username: "backup".to_string(),
            api_key: "secret".to_string(),
            auth_url: "https://auth.example.net/v1.0".to_string(),
            domain: defaults::domain(),
            region: "GRA".to_string(),
            chunk_size: defaults::chunk_size(),
        }
    }

    #[test]
    fn accepts_complete_config() {
        config().validate().expect("config should validate");
    }

    #[test]
    fn rejects_empty_username_and_small_chunks() {
        let mut bad = config();
        bad.username.clear();
        assert_eq!(
            bad.validate(),
            Err(SwiftConfigError::EmptySetting("username"))
        );

        let mut bad = config();
        bad.chunk_size = MIN_CHUNK_SIZE - 1;
        assert_eq!(
            bad.validate(),
            Err(SwiftConfigError::ChunkSizeTooSmall(MIN_CHUNK_SIZE - 1))
        );
    }
}
