// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! API route handlers.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use barry_core::{
    expiration::{EveryUnit, Expiration, ExpirationLine},
    keys::ApiKey,
    log_history::Message,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::ApiError;
use crate::engine::{Engine, FileAvailability, PushStatusEntry, ServerStatus};

/// Lists all projects.
pub const PROJECTS_ENDPOINT: &str = "/v1/projects";
/// Lists the files of one project.
pub const PROJECT_FILES_ENDPOINT: &str = "/v1/project/files";
/// Detailed information about one project.
pub const PROJECT_INFOS_ENDPOINT: &str = "/v1/project/infos";
/// Updates one project setting.
pub const PROJECT_SETTINGS_ENDPOINT: &str = "/v1/project/settings";
/// Archives a project.
pub const PROJECT_ARCHIVE_ENDPOINT: &str = "/v1/project/archive";
/// Un-archives a project.
pub const PROJECT_UNARCHIVE_ENDPOINT: &str = "/v1/project/unarchive";
/// Availability of one file.
pub const FILE_STATUS_ENDPOINT: &str = "/v1/file/status";
/// Streams one file.
pub const FILE_DOWNLOAD_ENDPOINT: &str = "/v1/file/download";
/// Accepts a manual multipart upload into the ingest queue.
pub const FILE_UPLOAD_ENDPOINT: &str = "/v1/file/upload";
/// Starts an outbound push.
pub const FILE_PUSH_ENDPOINT: &str = "/v1/file/push";
/// Progress of outbound pushes.
pub const FILE_PUSH_STATUS_ENDPOINT: &str = "/v1/file/push/status";
/// Lists or creates API keys.
pub const KEYS_ENDPOINT: &str = "/v1/keys";
/// Daemon status.
pub const STATUS_ENDPOINT: &str = "/v1/status";
/// Searches the in-memory log history.
pub const LOGS_ENDPOINT: &str = "/v1/logs";

#[derive(Debug, Deserialize)]
pub(super) struct ProjectQuery {
    project: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct FileQuery {
    project: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct PushQuery {
    project: String,
    filename: String,
    destination: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    #[serde(default = "default_log_max")]
    max: usize,
    #[serde(default = "default_log_topic")]
    topic: String,
}

fn default_log_max() -> usize {
    100
}

fn default_log_topic() -> String {
    barry_core::TOPIC_GLOBAL.to_string()
}

#[derive(Debug, Serialize)]
pub(super) struct ProjectSummary {
    name: String,
    file_count: u64,
    size_count: u64,
    cost: f64,
    archived: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct FileSummary {
    filename: String,
    mod_time: DateTime<Utc>,
    size: u64,
    status: crate::catalog::FileStatus,
    expire_local: DateTime<Utc>,
    expire_remote: DateTime<Utc>,
    expired_local: bool,
    expired_remote: bool,
    container: String,
    cost: f64,
}

#[derive(Debug, Serialize)]
pub(super) struct ProjectInfos {
    name: String,
    files: usize,
    size_count: u64,
    cost_count: f64,
    backup_every_secs: u64,
    local_expiration: Vec<String>,
    remote_expiration: Vec<String>,
    archived: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ProjectSettingsRequest {
    project: String,
    #[serde(default)]
    backup_every_secs: Option<u64>,
    #[serde(default)]
    local_expiration: Option<Vec<String>>,
    #[serde(default)]
    remote_expiration: Option<Vec<String>>,
}

pub(super) async fn list_projects(
    State(engine): State<Engine>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let mut summaries = Vec::new();
    for name in engine.catalog().project_names() {
        if let Some(project) = engine.catalog().project(&name) {
            summaries.push(ProjectSummary {
                name,
                file_count: project.file_count,
                size_count: project.size_count,
                cost: project.cost_count,
                archived: project.archived,
            });
        }
    }
    Ok(Json(summaries))
}

pub(super) async fn project_files(
    State(engine): State<Engine>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Vec<FileSummary>>, ApiError> {
    let project = engine
        .catalog()
        .project(&query.project)
        .ok_or_else(|| ApiError::not_found(format!("project '{}' not found", query.project)))?;

    let files = project
        .sorted_filenames()
        .into_iter()
        .filter_map(|filename| project.files.get(&filename))
        .map(|file| FileSummary {
            filename: file.filename.clone(),
            mod_time: file.mod_time,
            size: file.size,
            status: file.status,
            expire_local: file.expire_local,
            expire_remote: file.expire_remote,
            expired_local: file.expired_local,
            expired_remote: file.expired_remote,
            container: file.container.clone(),
            cost: file.cost,
        })
        .collect();
    Ok(Json(files))
}

pub(super) async fn project_infos(
    State(engine): State<Engine>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<ProjectInfos>, ApiError> {
    let project = engine
        .catalog()
        .project(&query.project)
        .ok_or_else(|| ApiError::not_found(format!("project '{}' not found", query.project)))?;

    let originals = |expiration: &Expiration| -> Vec<String> {
        expiration
            .lines
            .iter()
            .map(|line| line.original.clone())
            .collect()
    };
    Ok(Json(ProjectInfos {
        name: project.path.clone(),
        files: project.files.len(),
        size_count: project.size_count,
        cost_count: project.cost_count,
        backup_every_secs: project.backup_every.as_secs(),
        local_expiration: originals(&project.local_expiration),
        remote_expiration: originals(&project.remote_expiration),
        archived: project.archived,
    }))
}

pub(super) async fn project_settings(
    State(engine): State<Engine>,
    Json(request): Json<ProjectSettingsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let parse_custom = |lines: &[String]| -> Result<Expiration, ApiError> {
        let mut expiration =
            Expiration::parse(lines).map_err(|error| ApiError::bad_request(error.to_string()))?;
        expiration.custom = true;
        Ok(expiration)
    };

    let local = request
        .local_expiration
        .as_deref()
        .map(parse_custom)
        .transpose()?;
    let remote = request
        .remote_expiration
        .as_deref()
        .map(parse_custom)
        .transpose()?;

    engine.catalog().update_project(&request.project, |project| {
        if let Some(backup_every_secs) = request.backup_every_secs {
            project.backup_every = Duration::from_secs(backup_every_secs);
        }
        if let Some(local) = local {
            project.local_expiration = local;
        }
        if let Some(remote) = remote {
            project.remote_expiration = remote;
        }
    })?;
    Ok(Json(serde_json::json!({ "updated": request.project })))
}

pub(super) async fn project_archive(
    State(engine): State<Engine>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine
        .catalog()
        .update_project(&query.project, |project| project.archived = true)?;
    Ok(Json(serde_json::json!({ "archived": query.project })))
}

pub(super) async fn project_unarchive(
    State(engine): State<Engine>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine
        .catalog()
        .update_project(&query.project, |project| project.archived = false)?;
    Ok(Json(serde_json::json!({ "unarchived": query.project })))
}

pub(super) async fn file_status(
    State(engine): State<Engine>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileAvailability>, ApiError> {
    let availability = engine
        .make_file_available(&query.project, &query.filename)
        .await?;
    Ok(Json(availability))
}

pub(super) async fn file_download(
    State(engine): State<Engine>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let path = engine
        .prepare_download(&query.project, &query.filename)
        .await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|error| ApiError::internal(format!("unable to open local copy: {error}")))?;

    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", query.filename),
        )
        .body(body)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(response)
}

pub(super) async fn file_upload(
    State(engine): State<Engine>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut project: Option<String> = None;
    let mut expire: Option<u64> = None;
    let mut mod_time: Option<DateTime<Utc>> = None;
    let mut written: Option<(String, u64)> = None;
    let mut progress = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))?
    {
        match field.name() {
            Some("project") => {
                project = Some(text_field(field).await?);
            }
            Some("expire") => {
                let text = text_field(field).await?;
                expire = Some(
                    text.parse()
                        .map_err(|_| ApiError::bad_request("invalid 'expire' value"))?,
                );
            }
            Some("mod_time") => {
                let text = text_field(field).await?;
                mod_time = Some(
                    DateTime::parse_from_rfc3339(&text)
                        .map_err(|_| ApiError::bad_request("invalid 'mod_time' value"))?
                        .with_timezone(&Utc),
                );
            }
            Some("file") => {
                let project = project.as_deref().ok_or_else(|| {
                    ApiError::bad_request("'project' field must precede 'file'")
                })?;
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("file field has no filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|error| ApiError::bad_request(error.to_string()))?;
                let size = bytes.len() as u64;

                write_into_queue(engine.config(), project, &filename, &bytes, mod_time)
                    .await
                    .map_err(|error| ApiError::internal(error.to_string()))?;
                progress.push_str(&format!("received {size} bytes\n"));
                written = Some((filename, size));
            }
            _ => {}
        }
    }

    let project =
        project.ok_or_else(|| ApiError::bad_request("missing 'project' field"))?;
    let (filename, size) =
        written.ok_or_else(|| ApiError::bad_request("missing 'file' field"))?;

    if let Some(expire_secs) = expire {
        // The API expresses the override in plain seconds; build the one-line policy directly
        // instead of going through the `keep N UNIT` grammar.
        let expiration = Expiration {
            lines: vec![ExpirationLine {
                original: format!("keep {expire_secs} seconds (api override)"),
                keep: Duration::from_secs(expire_secs),
                every: 0,
                every_unit: EveryUnit::Default,
            }],
            reference_date: Utc::now(),
            file_count: 0,
            custom: true,
        };
        engine
            .catalog()
            .set_remote_expiration_override(&format!("{project}/{filename}"), expiration);
        progress.push_str(&format!("remote expiration override: {expire_secs}s\n"));
    }

    progress.push_str(&format!(
        "{project}/{filename} ({size} bytes) queued for ingestion\n"
    ));
    engine
        .log()
        .info(&project, format!("'{filename}' received over the API"));
    Ok((StatusCode::OK, progress).into_response())
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|error| ApiError::bad_request(error.to_string()))
}

/// Writes an uploaded file into the ingest queue.
///
/// The content lands under a dot-prefixed temporary name first; the wait list ignores dot
/// files, so a half-written upload can never be promoted.
async fn write_into_queue(
    config: &crate::config::AppConfig,
    project: &str,
    filename: &str,
    bytes: &[u8],
    mod_time: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        !project.contains('/') && !project.starts_with('.'),
        "invalid project name"
    );
    anyhow::ensure!(
        !filename.contains('/') && !filename.starts_with('.'),
        "invalid file name"
    );

    let dir = config.queue_path.join(project);
    tokio::fs::create_dir_all(&dir).await?;
    let partial = dir.join(format!(".upload-{filename}"));
    tokio::fs::write(&partial, bytes).await?;

    if let Some(mod_time) = mod_time {
        let system_time: std::time::SystemTime = mod_time.into();
        let times = std::fs::FileTimes::new()
            .set_accessed(system_time)
            .set_modified(system_time);
        let partial_clone = partial.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .append(true)
                .open(&partial_clone)?
                .set_times(times)
        })
        .await??;
    }

    tokio::fs::rename(&partial, dir.join(filename)).await?;
    Ok(())
}

pub(super) async fn file_push(
    State(engine): State<Engine>,
    Query(query): Query<PushQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine
        .push_file(&query.project, &query.filename, &query.destination)
        .await?;
    Ok(Json(serde_json::json!({
        "pushing": format!("{}/{}", query.project, query.filename),
        "destination": query.destination,
    })))
}

pub(super) async fn file_push_status(
    State(engine): State<Engine>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Vec<PushStatusEntry>>, ApiError> {
    Ok(Json(engine.push_status(&query.project, &query.filename)?))
}

pub(super) async fn list_keys(
    State(engine): State<Engine>,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    Ok(Json(engine.api_keys().list()))
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateKeyRequest {
    comment: String,
}

pub(super) async fn create_key(
    State(engine): State<Engine>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<ApiKey>, ApiError> {
    engine
        .api_keys()
        .add_new(&request.comment)
        .map(Json)
        .map_err(|error| ApiError::bad_request(error.to_string()))
}

pub(super) async fn server_status(
    State(engine): State<Engine>,
) -> Result<Json<ServerStatus>, ApiError> {
    Ok(Json(engine.status()))
}

pub(super) async fn search_logs(
    State(engine): State<Engine>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(
        engine.log().history().search(query.max, &query.topic),
    ))
}
