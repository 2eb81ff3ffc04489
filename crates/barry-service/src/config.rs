// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! The configuration is a single TOML file deserialized with serde; unknown keys are rejected.
//! Everything that can be validated eagerly is validated in [`AppConfig::validate`] so a
//! misconfigured daemon dies at startup, not mid-upload. The ingest queue and the local storage
//! must live on the same device because promotion into hot storage is a plain rename; this is
//! verified with a probe rename rather than trusting device ids.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use barry_core::{
    envelope::{Key, KEY_LEN},
    expiration::Expiration,
};
use barry_swift::SwiftConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{alert::SmtpConfig, cost::CostExpression};

/// Per-environment scheduling and threshold constants.
///
/// These are deliberately not configuration keys; tests shrink them through
/// [`Engine`][crate::engine::Engine] parameters instead.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Delay between ingest-directory scans.
    pub queue_scan_delay: Duration,
    /// How long a file must keep the same `(mod_time, size)` to be promoted.
    pub queue_stable_delay: Duration,
    /// Sleep before a failed file re-enters the wait list.
    pub retry_delay: Duration,
    /// Delay between expiration passes.
    pub check_expire_every: Duration,
    /// Delay between no-backup alert passes.
    pub no_backup_alert_schedule: Duration,
    /// Delay between self-backups of the daemon metadata.
    pub self_backup_delay: Duration,
    /// How long a decrypted local copy stays plaintext before re-encryption.
    pub re_encrypt_delay: Duration,
    /// Delay between keep-alive stats alerts.
    pub keep_alive_delay: Duration,
    /// Size-difference alert threshold, in percent.
    pub diff_alert_threshold_perc: u64,
    /// Files smaller than this never trigger the size-difference alert.
    pub diff_alert_min_size: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            queue_scan_delay: Duration::from_secs(60),
            queue_stable_delay: Duration::from_secs(90),
            retry_delay: Duration::from_secs(15 * 60),
            check_expire_every: Duration::from_secs(15 * 60),
            no_backup_alert_schedule: Duration::from_secs(60 * 60),
            self_backup_delay: Duration::from_secs(3 * 60 * 60),
            re_encrypt_delay: Duration::from_secs(60 * 60),
            keep_alive_delay: Duration::from_secs(24 * 60 * 60),
            diff_alert_threshold_perc: 20,
            diff_alert_min_size: 100 * 1024,
        }
    }
}

/// Default `backup_every` stamped on projects (and by the v0 → v1 record upgrade).
pub const PROJECT_DEFAULT_BACKUP_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Listen address of the API server.
    #[serde(default = "defaults::listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
        }
    }
}

/// A remote container with its cost expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    /// Container name; a `<name>_segments` companion must exist as well.
    pub name: String,
    /// Cost of storing a file here, as an expression over size and retention duration.
    pub cost: CostExpression,
}

/// A third-party push destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushDestinationConfig {
    /// Destination name used in API requests.
    pub name: String,
    /// Destination type tag (informational).
    #[serde(rename = "type")]
    pub dest_type: String,
    /// Base URL files are pushed under.
    pub url: String,
    /// Authentication key sent with each push.
    pub key: String,
}

/// An at-rest encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionKeyConfig {
    /// Key name recorded in envelope headers.
    pub name: String,
    /// File holding the key material.
    pub file: PathBuf,
    /// Whether new files are encrypted with this key.
    #[serde(default)]
    pub default: bool,
}

/// Retention policy strings, as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpirationStrings {
    /// Local (hot storage) policy lines.
    #[serde(default = "defaults::expiration_local")]
    pub local: Vec<String>,
    /// Remote (cold storage) policy lines.
    #[serde(default = "defaults::expiration_remote")]
    pub remote: Vec<String>,
}

impl Default for ExpirationStrings {
    fn default() -> Self {
        Self {
            local: defaults::expiration_local(),
            remote: defaults::expiration_remote(),
        }
    }
}

/// Parsed default retention policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationConfig {
    /// Local (hot storage) policy.
    pub local: Expiration,
    /// Remote (cold storage) policy.
    pub remote: Expiration,
}

/// Loaded encryption keys, resolved from the `[[encryption]]` sections.
#[derive(Clone, Default)]
pub struct EncryptionKeys {
    keys: HashMap<String, Key>,
    default: Option<String>,
}

impl EncryptionKeys {
    /// Resolves a key by name.
    pub fn lookup(&self, name: &str) -> Option<Key> {
        self.keys.get(name).copied()
    }

    /// The `(name, key)` pair new files are encrypted with, if any.
    pub fn default_key(&self) -> Option<(&str, Key)> {
        let name = self.default.as_deref()?;
        Some((name, self.keys[name]))
    }

    /// Whether any key is loaded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for EncryptionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeys")
            .field("names", &self.keys.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

/// The daemon configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Ingest directory an external process drops backups into.
    pub queue_path: PathBuf,
    /// Root of the daemon's local state (hot storage, catalog, retrieved copies).
    pub local_storage_path: PathBuf,
    /// Scratch directory; defaults to `<local_storage_path>/tmp`.
    #[serde(default)]
    pub temp_path: Option<PathBuf>,
    /// Size of the upload worker pool.
    #[serde(default = "defaults::num_uploaders")]
    pub num_uploaders: usize,
    /// Size of the encryption worker pool.
    #[serde(default = "defaults::num_encrypters")]
    pub num_encrypters: usize,
    /// Container receiving the daemon's own metadata backups.
    #[serde(default)]
    pub self_backup_container: Option<String>,
    /// Default retention policies.
    #[serde(default)]
    pub expiration: ExpirationStrings,
    /// Object store connection settings.
    pub swift: SwiftConfig,
    /// HTTP API settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// Remote containers, cheapest-match wins per upload.
    #[serde(default, rename = "container")]
    pub containers: Vec<ContainerConfig>,
    /// Push destinations.
    #[serde(default, rename = "push_destination")]
    pub push_destinations: Vec<PushDestinationConfig>,
    /// At-rest encryption keys.
    #[serde(default, rename = "encryption")]
    pub encryption: Vec<EncryptionKeyConfig>,
    /// SMTP relay for alerts; without it alerts only reach the log.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

impl AppConfig {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration '{}'", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("unable to parse configuration '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates settings that do not require touching the filesystem.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.queue_path != self.local_storage_path,
            "queue_path and local_storage_path can't be the same"
        );
        anyhow::ensure!(
            self.num_uploaders >= 1,
            "at least one uploader is needed (num_uploaders setting)"
        );
        anyhow::ensure!(
            self.num_encrypters >= 1,
            "at least one encrypter is needed (num_encrypters setting)"
        );
        anyhow::ensure!(
            !self.containers.is_empty(),
            "at least one [[container]] section is needed"
        );
        self.swift.validate()?;
        self.parse_expiration()
            .context("invalid [expiration] section")?;

        let defaults = self.encryption.iter().filter(|key| key.default).count();
        anyhow::ensure!(
            defaults <= 1,
            "at most one [[encryption]] key can be the default (found {defaults})"
        );
        for key in &self.encryption {
            anyhow::ensure!(
                !key.name.is_empty(),
                "encryption key names cannot be empty"
            );
        }
        Ok(())
    }

    /// Validates the on-disk side of the configuration and creates the state directories.
    ///
    /// The queue and local storage must be existing directories on the same device; this is
    /// probed with an actual rename because that is the operation ingestion relies on.
    pub fn check_paths(&self) -> anyhow::Result<()> {
        for (name, path) in [
            ("queue_path", &self.queue_path),
            ("local_storage_path", &self.local_storage_path),
        ] {
            anyhow::ensure!(
                path.is_dir(),
                "{name} '{}' is not a directory",
                path.display()
            );
        }
        for dir in [
            self.data_dir(),
            self.files_dir(),
            self.retrieved_dir(),
            self.temp_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("unable to create '{}'", dir.display()))?;
        }

        let probe = self.queue_path.join(".barry-device-probe");
        let target = self.temp_dir().join(".barry-device-probe");
        std::fs::write(&probe, b"probe")?;
        let result = std::fs::rename(&probe, &target);
        let _ = std::fs::remove_file(&probe);
        let _ = std::fs::remove_file(&target);
        result.map_err(|error| {
            anyhow::anyhow!(
                "'{}' and '{}' must be on the same disk/device/partition: {error}",
                self.queue_path.display(),
                self.local_storage_path.display()
            )
        })
    }

    /// Parses the `[expiration]` section into policies.
    pub fn parse_expiration(&self) -> anyhow::Result<ExpirationConfig> {
        Ok(ExpirationConfig {
            local: Expiration::parse(&self.expiration.local).context("expiration, local")?,
            remote: Expiration::parse(&self.expiration.remote).context("expiration, remote")?,
        })
    }

    /// Reads the `[[encryption]]` key files and derives the 256-bit keys.
    pub fn load_encryption_keys(&self) -> anyhow::Result<EncryptionKeys> {
        let mut keys = HashMap::new();
        let mut default = None;
        for config in &self.encryption {
            let material = std::fs::read(&config.file).with_context(|| {
                format!(
                    "unable to read encryption key '{}' from '{}'",
                    config.name,
                    config.file.display()
                )
            })?;
            anyhow::ensure!(
                material.len() >= KEY_LEN,
                "encryption key file '{}' holds fewer than {KEY_LEN} bytes",
                config.file.display()
            );
            // Key files hold free-form material; the actual AES key is its digest.
            let key: Key = Sha256::digest(&material).into();
            keys.insert(config.name.clone(), key);
            if config.default {
                default = Some(config.name.clone());
            }
        }
        Ok(EncryptionKeys { keys, default })
    }

    /// Directory holding the catalog and the API-key store.
    pub fn data_dir(&self) -> PathBuf {
        self.local_storage_path.join("data")
    }

    /// Hot storage root.
    pub fn files_dir(&self) -> PathBuf {
        self.local_storage_path.join("files")
    }

    /// Root for rehydrated cold copies.
    pub fn retrieved_dir(&self) -> PathBuf {
        self.local_storage_path.join("retrieved")
    }

    /// Scratch directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_path
            .clone()
            .unwrap_or_else(|| self.local_storage_path.join("tmp"))
    }

    /// Path of the JSON catalog.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir().join("projects.db")
    }

    /// Path of the API-key store.
    pub fn api_keys_path(&self) -> PathBuf {
        self.data_dir().join("api-keys.db")
    }
}

/// Configuration defaults.
pub mod defaults {
    use std::net::SocketAddr;

    /// Default API listen address.
    pub fn listen() -> SocketAddr {
        "0.0.0.0:8787".parse().expect("valid literal address")
    }

    /// Default upload pool size.
    pub fn num_uploaders() -> usize {
        2
    }

    /// Default encryption pool size.
    pub fn num_encrypters() -> usize {
        2
    }

    /// Default local retention policy.
    pub fn expiration_local() -> Vec<String> {
        vec!["keep 30 days".to_string()]
    }

    /// Default remote retention policy.
    pub fn expiration_remote() -> Vec<String> {
        vec![
            "keep 30 days".to_string(),
            "keep 90 days every 7 files".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        queue_path = "var/queue"
        local_storage_path = "var/storage"

        [swift]
        username = "backup"
        api_key = "secret"
        auth_url = "https://auth.example.net/v1.0"
        region = "GRA"

        [[container]]
        name = "cold"
        cost = "size_GB*0.1 + duration_days*0.01"
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: AppConfig = toml::from_str(MINIMAL).expect("config should parse");
        config.validate().expect("config should validate");

        assert_eq!(config.num_uploaders, 2);
        assert_eq!(config.api.listen, defaults::listen());
        assert_eq!(config.expiration.local, vec!["keep 30 days"]);
        assert_eq!(
            config.expiration.remote,
            vec!["keep 30 days", "keep 90 days every 7 files"]
        );
        assert_eq!(config.containers.len(), 1);
        assert!(config.smtp.is_none());
    }

    #[test]
    fn rejects_unknown_settings() {
        let with_unknown = format!("{MINIMAL}\nnot_a_setting = true\n");
        toml::from_str::<AppConfig>(&with_unknown).expect_err("unknown setting must be rejected");
    }

    #[test]
    fn rejects_zero_uploaders_and_missing_containers() {
        let mut config: AppConfig = toml::from_str(MINIMAL).expect("config should parse");
        config.num_uploaders = 0;
        config.validate().expect_err("zero uploaders must fail");

        let mut config: AppConfig = toml::from_str(MINIMAL).expect("config should parse");
        config.containers.clear();
        config.validate().expect_err("no containers must fail");
    }

    #[test]
    fn rejects_bad_expiration_and_bad_cost() {
        let mut config: AppConfig = toml::from_str(MINIMAL).expect("config should parse");
        config.expiration.local = vec!["keep 3 weeks".to_string()];
        config.validate().expect_err("bad unit must fail");

        let bad_cost = MINIMAL.replace("size_GB*0.1", "size_PB*0.1");
        toml::from_str::<AppConfig>(&bad_cost).expect_err("unknown cost variable must fail");
    }

    #[test]
    fn same_device_probe_passes_inside_one_tempdir() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let mut config: AppConfig = toml::from_str(MINIMAL)?;
        config.queue_path = dir.path().join("queue");
        config.local_storage_path = dir.path().join("storage");
        std::fs::create_dir_all(&config.queue_path)?;
        std::fs::create_dir_all(&config.local_storage_path)?;

        config.check_paths()?;
        assert!(config.files_dir().is_dir());
        assert!(config.retrieved_dir().is_dir());
        Ok(())
    }
}
