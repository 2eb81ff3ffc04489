// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! The daemon's HTTP API.
//!
//! Every request must carry a valid API key and the protocol version integer; every response
//! carries `Cache-Control: no-store` and the latest known client version, so outdated CLI
//! clients can prompt their users to upgrade.

mod routes;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::CatalogError,
    engine::{Engine, EngineError},
};

/// Protocol version clients must present.
pub const PROTOCOL_VERSION: u32 = 1;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-barry-key";
/// Header carrying the protocol version.
pub const PROTOCOL_HEADER: &str = "x-barry-protocol";
/// Response header advertising the newest known client version.
pub const LATEST_CLIENT_VERSION_HEADER: &str = "latest-known-client-version";

/// A structured API error, serialized as `{"error": ..., "message": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match &error {
            EngineError::FileNotFound { .. } => Self::not_found(error.to_string()),
            EngineError::UnknownDestination(_) => Self::not_found(error.to_string()),
            EngineError::Catalog(CatalogError::UnknownProject(_)) => {
                Self::not_found(error.to_string())
            }
            EngineError::NotAvailable(_) => {
                Self::new(StatusCode::CONFLICT, "not_available", error.to_string())
            }
            _ => Self::internal(error.to_string()),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        match &error {
            CatalogError::UnknownProject(_) | CatalogError::FileNotFound { .. } => {
                Self::not_found(error.to_string())
            }
            CatalogError::DuplicateFile { .. } => {
                Self::new(StatusCode::CONFLICT, "duplicate", error.to_string())
            }
            _ => Self::internal(error.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    key: Option<String>,
}

/// Rejects requests without a valid API key or with a protocol version mismatch.
async fn require_api_key(
    State(engine): State<Engine>,
    Query(query): Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    let protocol = request
        .headers()
        .get(PROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u32>().ok());
    if protocol != Some(PROTOCOL_VERSION) {
        return ApiError::new(
            StatusCode::BAD_REQUEST,
            "protocol_mismatch",
            format!("this server speaks protocol version {PROTOCOL_VERSION}"),
        )
        .into_response();
    }

    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.key);
    let valid = key
        .as_deref()
        .is_some_and(|key| engine.api_keys().is_valid_key(key));
    if !valid {
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_key",
            "missing or invalid API key",
        )
        .into_response();
    }

    next.run(request).await
}

/// Stamps the cache and client-version headers on every response.
async fn stamp_response_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response.headers_mut().insert(
        LATEST_CLIENT_VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Builds the API router.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route(routes::PROJECTS_ENDPOINT, get(routes::list_projects))
        .route(routes::PROJECT_FILES_ENDPOINT, get(routes::project_files))
        .route(routes::PROJECT_INFOS_ENDPOINT, get(routes::project_infos))
        .route(
            routes::PROJECT_SETTINGS_ENDPOINT,
            post(routes::project_settings),
        )
        .route(
            routes::PROJECT_ARCHIVE_ENDPOINT,
            post(routes::project_archive),
        )
        .route(
            routes::PROJECT_UNARCHIVE_ENDPOINT,
            post(routes::project_unarchive),
        )
        .route(routes::FILE_STATUS_ENDPOINT, get(routes::file_status))
        .route(routes::FILE_DOWNLOAD_ENDPOINT, get(routes::file_download))
        .route(routes::FILE_UPLOAD_ENDPOINT, post(routes::file_upload))
        .route(routes::FILE_PUSH_ENDPOINT, post(routes::file_push))
        .route(
            routes::FILE_PUSH_STATUS_ENDPOINT,
            get(routes::file_push_status),
        )
        .route(
            routes::KEYS_ENDPOINT,
            get(routes::list_keys).post(routes::create_key),
        )
        .route(routes::STATUS_ENDPOINT, get(routes::server_status))
        .route(routes::LOGS_ENDPOINT, get(routes::search_logs))
        .layer(middleware::from_fn_with_state(
            engine.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn(stamp_response_headers))
        .with_state(engine)
}

/// Serves the API until `cancel` fires.
pub async fn serve(engine: Engine, cancel: CancellationToken) -> anyhow::Result<()> {
    let listen = engine.config().api.listen;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "API server listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
