// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Contract tests for the HTTP API, exercised through the router without a socket.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use barry_core::Log;
use barry_service::{
    alert::LogAlertSender,
    config::{AppConfig, Tuning},
    engine::Engine,
    server::{self, API_KEY_HEADER, PROTOCOL_HEADER, PROTOCOL_VERSION},
};
use barry_swift::test_utils::MemoryObjectStore;
use barry_test_utils::wait_until;
use tower::ServiceExt;

const STABLE: Duration = Duration::from_secs(90);

struct ApiBed {
    _dir: tempfile::TempDir,
    _cancel: tokio_util::sync::CancellationToken,
    engine: Engine,
    router: Router,
    key: String,
}

async fn api_bed() -> ApiBed {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("queue")).expect("queue dir");
    std::fs::create_dir_all(dir.path().join("storage")).expect("storage dir");

    let toml = format!(
        r#"
        queue_path = "{queue}"
        local_storage_path = "{storage}"

        [swift]
        username = "backup"
        api_key = "secret"
        auth_url = "https://auth.example.net/v1.0"
        region = "TEST"

        [[container]]
        name = "cold"
        cost = "size_GB * 0.1"
        "#,
        queue = dir.path().join("queue").display(),
        storage = dir.path().join("storage").display(),
    );
    let config: AppConfig = toml::from_str(&toml).expect("test config should parse");

    let never = Duration::from_secs(3600);
    let tuning = Tuning {
        queue_scan_delay: never,
        queue_stable_delay: STABLE,
        retry_delay: Duration::from_millis(50),
        check_expire_every: never,
        no_backup_alert_schedule: never,
        self_backup_delay: never,
        re_encrypt_delay: never,
        keep_alive_delay: never,
        diff_alert_threshold_perc: 20,
        diff_alert_min_size: 100 * 1024,
    };

    let store = MemoryObjectStore::with_containers(["cold"]);
    let engine = Engine::with_tuning(
        config,
        Arc::new(store),
        Arc::new(LogAlertSender),
        Log::default(),
        tuning,
    )
    .await
    .expect("engine should build");
    let cancel = tokio_util::sync::CancellationToken::new();
    engine.spawn_tasks(&cancel);

    let key = engine.api_keys().list()[0].key.clone();
    let router = server::router(engine.clone());
    ApiBed {
        _dir: dir,
        _cancel: cancel,
        engine,
        router,
        key,
    }
}

fn authed(bed: &ApiBed, request: axum::http::request::Builder) -> axum::http::request::Builder {
    request
        .header(API_KEY_HEADER, &bed.key)
        .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    serde_json::from_slice(&bytes).expect("body should be JSON")
}

#[tokio::test]
async fn rejects_missing_key_and_wrong_protocol() {
    let bed = api_bed().await;

    // No credentials at all.
    let response = bed
        .router
        .clone()
        .oneshot(
            Request::get("/v1/status")
                .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error = body_json(response).await;
    assert_eq!(error["error"], "invalid_key");
    assert!(error["message"].is_string());

    // Valid key, wrong protocol.
    let response = bed
        .router
        .clone()
        .oneshot(
            Request::get("/v1/status")
                .header(API_KEY_HEADER, &bed.key)
                .header(PROTOCOL_HEADER, "999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "protocol_mismatch");

    // A bogus key of the right length.
    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::get("/v1/status"))
                .header(API_KEY_HEADER, "x".repeat(64))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stamps_cache_and_version_headers_on_every_response() {
    let bed = api_bed().await;

    // Even an unauthorized response carries the headers.
    let response = bed
        .router
        .clone()
        .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    assert_eq!(
        response
            .headers()
            .get("latest-known-client-version")
            .unwrap(),
        env!("CARGO_PKG_VERSION")
    );
}

#[tokio::test]
async fn status_projects_and_logs_respond() {
    let bed = api_bed().await;

    let response = bed
        .router
        .clone()
        .oneshot(authed(&bed, Request::get("/v1/status")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(status["files"], 0);
    assert_eq!(status["uploaders"].as_array().unwrap().len(), 2);

    let response = bed
        .router
        .clone()
        .oneshot(authed(&bed, Request::get("/v1/projects")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));

    let response = bed
        .router
        .clone()
        .oneshot(authed(&bed, Request::get("/v1/logs")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn key_management_lists_and_creates() {
    let bed = api_bed().await;

    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/keys"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"comment": "deploy bot"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["comment"], "deploy bot");
    assert_eq!(created["key"].as_str().unwrap().len(), 64);

    let response = bed
        .router
        .clone()
        .oneshot(authed(&bed, Request::get("/v1/keys")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    // Duplicate comments are rejected.
    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/keys"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"comment": "deploy bot"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_files_yield_structured_not_found() {
    let bed = api_bed().await;

    let response = bed
        .router
        .clone()
        .oneshot(
            authed(
                &bed,
                Request::get("/v1/file/status?project=ghost&filename=nope"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = body_json(response).await;
    assert_eq!(error["error"], "not_found");
}

#[tokio::test]
async fn upload_ingest_status_download_roundtrip() {
    let bed = api_bed().await;

    // Manual upload with an explicit mod_time and a remote-expiration override.
    let boundary = "testboundary";
    let mod_time = "2026-07-01T12:00:00Z";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"project\"\r\n\r\n\
         proj-api\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"expire\"\r\n\r\n\
         86400\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"mod_time\"\r\n\r\n\
         {mod_time}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"dump.sql\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         api-uploaded payload\r\n\
         --{boundary}--\r\n"
    );
    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/file/upload"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The file landed in the ingest queue with the client-provided mtime.
    let queued = bed.engine.config().queue_path.join("proj-api/dump.sql");
    assert_eq!(
        std::fs::read(&queued).expect("queued file"),
        b"api-uploaded payload"
    );
    let mtime = std::fs::metadata(&queued).expect("metadata").modified().expect("mtime");
    let expected: SystemTime = chrono::DateTime::parse_from_rfc3339(mod_time)
        .unwrap()
        .with_timezone(&chrono::Utc)
        .into();
    assert_eq!(mtime, expected);

    // Promote it through the wait list and let the engine ingest it.
    let now = SystemTime::now();
    bed.engine.wait_list().scan_at(now);
    bed.engine.wait_list().scan_at(now + STABLE);
    let engine = bed.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move { engine.catalog().file_exists("proj-api", "dump.sql") }
        })
        .await,
        "upload was not ingested"
    );

    // The override shortened the remote retention to one day.
    let file = bed
        .engine
        .catalog()
        .find_file("proj-api", "dump.sql")
        .expect("file");
    assert_eq!(file.expire_remote - file.mod_time, chrono::TimeDelta::days(1));

    // Status reports available, download streams the bytes back.
    let response = bed
        .router
        .clone()
        .oneshot(
            authed(
                &bed,
                Request::get("/v1/file/status?project=proj-api&filename=dump.sql"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["status"], "available");
    assert_eq!(status["eta"], 0);

    let response = bed
        .router
        .clone()
        .oneshot(
            authed(
                &bed,
                Request::get("/v1/file/download?project=proj-api&filename=dump.sql"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("download body");
    assert_eq!(&bytes[..], b"api-uploaded payload");
}

#[tokio::test]
async fn archive_and_settings_update_project_records() {
    let bed = api_bed().await;
    bed.engine
        .catalog()
        .find_or_create_project("proj-a")
        .expect("project");

    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/project/archive?project=proj-a"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(bed.engine.catalog().project("proj-a").unwrap().archived);

    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/project/settings"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"project": "proj-a", "backup_every_secs": 7200,
                        "local_expiration": ["keep 12 hours"]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let project = bed.engine.catalog().project("proj-a").unwrap();
    assert_eq!(project.backup_every, Duration::from_secs(7200));
    assert!(project.local_expiration.custom);
    assert_eq!(project.local_expiration.lines[0].original, "keep 12 hours");

    // Bad expiration strings are rejected without touching the record.
    let response = bed
        .router
        .clone()
        .oneshot(
            authed(&bed, Request::post("/v1/project/settings"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"project": "proj-a", "remote_expiration": ["keep 3 fortnights"]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
