// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the lifecycle engine against the in-memory object store.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use barry_core::{envelope, Log};
use barry_service::{
    alert::{Alert, AlertKind, ChannelAlertSender},
    catalog::FileStatus,
    config::{AppConfig, Tuning},
    engine::{Engine, FileStatusKind},
};
use barry_swift::{test_utils::MemoryObjectStore, AvailabilityState};
use barry_test_utils::wait_until;
use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const STABLE: Duration = Duration::from_secs(90);

struct TestBed {
    _dir: tempfile::TempDir,
    engine: Engine,
    store: MemoryObjectStore,
    alerts: UnboundedReceiver<Alert>,
    cancel: CancellationToken,
}

impl Drop for TestBed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn base_config(dir: &std::path::Path, extra: &str) -> AppConfig {
    let toml = format!(
        r#"
        queue_path = "{queue}"
        local_storage_path = "{storage}"

        [expiration]
        local = ["keep 1 day"]
        remote = ["keep 7 days"]

        [swift]
        username = "backup"
        api_key = "secret"
        auth_url = "https://auth.example.net/v1.0"
        region = "TEST"

        [[container]]
        name = "hot"
        cost = "size_GB * 1"

        [[container]]
        name = "cold"
        cost = "size_GB * 0.1 + duration_days * 0.0001"
        {extra}
        "#,
        queue = dir.join("queue").display(),
        storage = dir.join("storage").display(),
    );
    toml::from_str(&toml).expect("test config should parse")
}

/// Tuning with all periodic loops effectively disabled and a short retry delay, so tests drive
/// every step explicitly.
fn test_tuning() -> Tuning {
    let never = Duration::from_secs(3600);
    Tuning {
        queue_scan_delay: never,
        queue_stable_delay: STABLE,
        retry_delay: Duration::from_millis(50),
        check_expire_every: never,
        no_backup_alert_schedule: never,
        self_backup_delay: never,
        re_encrypt_delay: Duration::from_millis(10),
        keep_alive_delay: never,
        diff_alert_threshold_perc: 20,
        diff_alert_min_size: 100 * 1024,
    }
}

async fn testbed_with(extra_config: &str) -> TestBed {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("queue")).expect("queue dir");
    std::fs::create_dir_all(dir.path().join("storage")).expect("storage dir");

    let config = base_config(dir.path(), extra_config);
    let store = MemoryObjectStore::with_containers(["hot", "cold", "barry-selfbackup"]);
    let (alert_sender, alerts) = ChannelAlertSender::new();
    let engine = Engine::with_tuning(
        config,
        Arc::new(store.clone()),
        Arc::new(alert_sender),
        Log::default(),
        test_tuning(),
    )
    .await
    .expect("engine should build");

    let cancel = CancellationToken::new();
    engine.spawn_tasks(&cancel);

    TestBed {
        _dir: dir,
        engine,
        store,
        alerts,
        cancel,
    }
}

async fn testbed() -> TestBed {
    testbed_with("").await
}

fn drop_into_queue(engine: &Engine, project: &str, filename: &str, content: &[u8]) {
    let dir = engine.config().queue_path.join(project);
    std::fs::create_dir_all(&dir).expect("project dir");
    std::fs::write(dir.join(filename), content).expect("write queue file");
}

/// Promotes everything currently stable in the queue and waits for ingestion of
/// `project/filename` to settle into the catalog.
async fn ingest_and_wait(bed: &TestBed, project: &str, filename: &str) {
    let now = SystemTime::now();
    bed.engine.wait_list().scan_at(now);
    bed.engine.wait_list().scan_at(now + STABLE);

    let engine = bed.engine.clone();
    let (project, filename) = (project.to_string(), filename.to_string());
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            let (project, filename) = (project.clone(), filename.clone());
            async move { engine.catalog().file_exists(&project, &filename) }
        })
        .await,
        "file was not ingested in time"
    );
}

#[tokio::test]
async fn stable_file_is_uploaded_moved_and_recorded() {
    let bed = testbed().await;
    let content = vec![7u8; 1024 * 1024];
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", &content);

    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    let file = bed
        .engine
        .catalog()
        .find_file("proj-a", "db.tar.gz")
        .expect("file should be recorded");
    assert_eq!(file.status, FileStatus::Uploaded);
    assert_eq!(file.size, content.len() as u64);
    assert_eq!(file.expire_local - file.mod_time, TimeDelta::hours(24));
    assert_eq!(file.expire_remote - file.mod_time, TimeDelta::hours(168));
    assert_eq!(file.expire_local_original, "keep 1 day");

    // Cheapest container wins: cold is an order of magnitude cheaper than hot.
    assert_eq!(file.container, "cold");
    assert!(file.cost > 0.0 && file.cost < 0.001, "cost = {}", file.cost);

    // The source moved out of the queue into hot storage.
    let queue_copy = bed.engine.config().queue_path.join("proj-a/db.tar.gz");
    let hot_copy = bed
        .engine
        .config()
        .files_dir()
        .join("proj-a/db.tar.gz");
    assert!(!queue_copy.exists());
    assert_eq!(std::fs::read(&hot_copy).expect("hot copy"), content);

    // And the cold copy is in the object store.
    assert_eq!(
        bed.store.object("cold", "proj-a/db.tar.gz").expect("cold copy"),
        content
    );
}

#[tokio::test]
async fn known_files_are_never_requeued() {
    let bed = testbed().await;
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");
    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;
    assert_eq!(bed.store.upload_count(), 1);

    // The file is gone from the queue (moved); even if an identical one reappears, the catalog
    // filter must reject it.
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");
    let now = SystemTime::now();
    bed.engine.wait_list().scan_at(now);
    bed.engine.wait_list().scan_at(now + STABLE);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bed.store.upload_count(), 1, "no second upload may happen");
}

#[tokio::test]
async fn failed_upload_alerts_and_retries_through_the_wait_list() {
    let mut bed = testbed().await;
    bed.store.fail_next_uploads(1);
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");

    let now = SystemTime::now();
    bed.engine.wait_list().scan_at(now);
    bed.engine.wait_list().scan_at(now + STABLE);

    // The failure produces an alert, then the file re-enters the wait list after the retry
    // delay and the next scans pick it up again.
    let alert = tokio::time::timeout(Duration::from_secs(5), bed.alerts.recv())
        .await
        .expect("alert should arrive")
        .expect("alert channel open");
    assert_eq!(alert.kind, AlertKind::Bad);
    assert!(alert.subject.contains("db.tar.gz"), "subject: {}", alert.subject);

    let engine = bed.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move {
                let rescan = SystemTime::now();
                engine.wait_list().scan_at(rescan);
                engine.wait_list().scan_at(rescan + STABLE);
                engine.catalog().file_exists("proj-a", "db.tar.gz")
            }
        })
        .await,
        "retry never succeeded"
    );
    assert_eq!(bed.store.upload_count(), 1);
    assert_eq!(
        bed.engine.catalog().get_filenames("proj-a").expect("project"),
        vec!["db.tar.gz"]
    );
}

#[tokio::test]
async fn interrupted_ingest_is_rediscovered_idempotently() {
    let bed = testbed().await;

    // Simulate a crash between upload-success and the catalog record: the object exists
    // remotely, the file still sits in the queue, the catalog knows nothing.
    bed.store.insert_object(
        "cold",
        "proj-a/db.tar.gz",
        b"payload".to_vec(),
        AvailabilityState::Unsealed,
    );
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");

    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    // The idempotent overwrite yields the same object and exactly one catalog entry.
    assert_eq!(bed.store.object("cold", "proj-a/db.tar.gz").unwrap(), b"payload");
    assert_eq!(bed.engine.catalog().stats().files, 1);
}

#[tokio::test]
async fn availability_walks_sealed_unsealing_retrieving_available() {
    let bed = testbed().await;
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"cold payload");
    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    // Expire the local copy so downloads must go through cold storage.
    bed.engine
        .catalog()
        .update_file("proj-a", "db.tar.gz", |file| file.expired_local = true)
        .expect("update");
    bed.store
        .set_availability("cold", "proj-a/db.tar.gz", AvailabilityState::Sealed);
    bed.store
        .set_unseal_eta("cold", "proj-a/db.tar.gz", Duration::from_secs(600));

    // Sealed: the first status query requests an unseal.
    let status = bed
        .engine
        .make_file_available("proj-a", "db.tar.gz")
        .await
        .expect("status");
    assert_eq!(status.status, FileStatusKind::Unsealing);
    assert!(status.eta > Duration::ZERO);

    // Still unsealing while the provider works.
    let status = bed
        .engine
        .make_file_available("proj-a", "db.tar.gz")
        .await
        .expect("status");
    assert_eq!(status.status, FileStatusKind::Unsealing);

    // Unsealed: the next poll starts a retrieval.
    bed.store
        .set_availability("cold", "proj-a/db.tar.gz", AvailabilityState::Unsealed);
    let status = bed
        .engine
        .make_file_available("proj-a", "db.tar.gz")
        .await
        .expect("status");
    assert_eq!(status.status, FileStatusKind::Retrieving);

    // Poll until the retriever finishes and the record is promoted.
    let engine = bed.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move {
                matches!(
                    engine.make_file_available("proj-a", "db.tar.gz").await,
                    Ok(status) if status.status == FileStatusKind::Available
                )
            }
        })
        .await,
        "retrieval never completed"
    );

    let file = bed
        .engine
        .catalog()
        .find_file("proj-a", "db.tar.gz")
        .expect("file");
    let retrieved = file.retrieved_path.expect("retrieved path should be set");
    assert_eq!(
        retrieved,
        bed.engine
            .config()
            .retrieved_dir()
            .join("proj-a/db.tar.gz"),
        "retrieved copies are namespaced by project"
    );
    assert_eq!(std::fs::read(&retrieved).expect("retrieved copy"), b"cold payload");
    assert!(file.retriever.is_none());

    // Downloads are now served from the retrieved copy.
    let path = bed
        .engine
        .prepare_download("proj-a", "db.tar.gz")
        .await
        .expect("download path");
    assert_eq!(path, retrieved);
}

#[tokio::test]
async fn no_backup_alert_reaches_the_operator() {
    let mut bed = testbed().await;
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");
    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    // Age the newest file past 1.5 x backup_every (24h by default).
    bed.engine
        .catalog()
        .update_file("proj-a", "db.tar.gz", |file| {
            file.mod_time = Utc::now() - TimeDelta::hours(40);
        })
        .expect("update");

    bed.engine.catalog().no_backup_alerts(Utc::now());

    let alert = tokio::time::timeout(Duration::from_secs(5), bed.alerts.recv())
        .await
        .expect("alert should arrive")
        .expect("alert channel open");
    assert_eq!(alert.kind, AlertKind::Bad);
    assert!(alert.content.contains("proj-a"), "content: {}", alert.content);
}

#[tokio::test]
async fn self_backup_roundtrips_catalog_and_keys() {
    let bed = testbed_with("self_backup_container = \"barry-selfbackup\"").await;
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", b"payload");
    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    bed.engine.self_backup().await.expect("self-backup");

    let catalog_bytes = bed
        .store
        .object("barry-selfbackup", ".barry/projects.db")
        .expect("catalog backup");
    let local_bytes =
        std::fs::read(bed.engine.config().catalog_path()).expect("local catalog");
    assert_eq!(catalog_bytes, local_bytes);

    // Restore into a fresh data directory and compare byte for byte.
    let restore_dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(restore_dir.path().join("queue")).expect("queue dir");
    std::fs::create_dir_all(restore_dir.path().join("storage")).expect("storage dir");
    let mut restore_config = base_config(restore_dir.path(), "");
    restore_config.self_backup_container = Some("barry-selfbackup".to_string());
    restore_config.check_paths().expect("paths");

    Engine::self_restore(&restore_config, Arc::new(bed.store.clone()))
        .await
        .expect("self-restore");
    assert_eq!(
        std::fs::read(restore_config.catalog_path()).expect("restored catalog"),
        local_bytes
    );
    let keys = std::fs::read(restore_config.api_keys_path()).expect("restored keys");
    assert_eq!(
        keys,
        std::fs::read(bed.engine.config().api_keys_path()).expect("local keys")
    );
}

#[tokio::test]
async fn encryption_wraps_uploads_and_reencrypts_after_download() {
    // A 64-byte key file; the daemon derives the AES key from it.
    let key_dir = tempfile::tempdir().expect("tempdir");
    let key_file = key_dir.path().join("backup.key");
    std::fs::write(&key_file, vec![0x42u8; 64]).expect("key file");

    let bed = testbed_with(&format!(
        "[[encryption]]\nname = \"default\"\nfile = \"{}\"\ndefault = true\n",
        key_file.display()
    ))
    .await;

    let content = b"top secret database dump".to_vec();
    drop_into_queue(&bed.engine, "proj-a", "db.tar.gz", &content);
    ingest_and_wait(&bed, "proj-a", "db.tar.gz").await;

    let file = bed
        .engine
        .catalog()
        .find_file("proj-a", "db.tar.gz")
        .expect("file");
    assert!(file.encrypted);

    // Both the cold copy and the hot copy are envelopes, not plaintext.
    let cold = bed.store.object("cold", "proj-a/db.tar.gz").expect("cold copy");
    assert_eq!(&cold[..envelope::MAGIC.len()], envelope::MAGIC);
    let hot_path = bed.engine.config().files_dir().join("proj-a/db.tar.gz");
    let hot = std::fs::read(&hot_path).expect("hot copy");
    assert_eq!(&hot[..envelope::MAGIC.len()], envelope::MAGIC);

    // Downloading decrypts the hot copy in place and arms re-encryption.
    let path = bed
        .engine
        .prepare_download("proj-a", "db.tar.gz")
        .await
        .expect("download path");
    assert_eq!(std::fs::read(&path).expect("decrypted copy"), content);
    let file = bed
        .engine
        .catalog()
        .find_file("proj-a", "db.tar.gz")
        .expect("file");
    assert!(!file.encrypted);
    assert!(file.re_encrypt_date.is_some());

    // Once due, the re-encryption pass restores the envelope.
    tokio::time::sleep(Duration::from_millis(20)).await;
    bed.engine.re_encrypt_due_files().await;
    let file = bed
        .engine
        .catalog()
        .find_file("proj-a", "db.tar.gz")
        .expect("file");
    assert!(file.encrypted);
    assert_eq!(file.re_encrypt_date, None);
    let hot = std::fs::read(&hot_path).expect("hot copy");
    assert_eq!(&hot[..envelope::MAGIC.len()], envelope::MAGIC);

    // And a second download decrypts it again.
    let path = bed
        .engine
        .prepare_download("proj-a", "db.tar.gz")
        .await
        .expect("download path");
    assert_eq!(std::fs::read(&path).expect("decrypted copy"), content);
}

#[tokio::test]
async fn diff_size_alert_fires_for_large_variations() {
    let mut bed = testbed().await;

    let big = vec![1u8; 200 * 1024];
    drop_into_queue(&bed.engine, "proj-a", "day1.tar", &big);
    ingest_and_wait(&bed, "proj-a", "day1.tar").await;

    // Half the size of the previous backup: > 20% difference over the 100 KB floor.
    let small = vec![1u8; 100 * 1024];
    drop_into_queue(&bed.engine, "proj-a", "day2.tar", &small);
    ingest_and_wait(&bed, "proj-a", "day2.tar").await;

    let alert = tokio::time::timeout(Duration::from_secs(5), bed.alerts.recv())
        .await
        .expect("alert should arrive")
        .expect("alert channel open");
    assert_eq!(alert.kind, AlertKind::Bad);
    assert!(
        alert.subject.contains("size difference"),
        "subject: {}",
        alert.subject
    );

    // Both files are recorded regardless; the alert is advisory.
    assert_eq!(bed.engine.catalog().stats().files, 2);
}
