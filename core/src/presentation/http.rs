// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! HTTP ingress (component G): the four public routes plus the tolerant
//! JSON normalisation pipeline that `/v1/execute` runs every payload
//! through before it ever reaches [`crate::application::pipeline`].
//!
//! Grounded in the teacher's `presentation::api` `AppState`/`Router`
//! pattern; the normalisation sequence itself is grounded in the
//! original's `http_server.py` request handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::application::pipeline::ExecutionPipeline;
use crate::domain::execution::{ExecutionRequest, ExecutionResult};
use crate::domain::file_record::{FileKey, FileMetadataView};
use crate::domain::validation::{self, ValidationError};
use crate::infrastructure::index::FileIndex;
use crate::infrastructure::json_canon::{self, CanonError};
use crate::infrastructure::object_store::{ObjectStore, PendingWrite};
use crate::presentation::error::ApiError;
use crate::presentation::origin_guard::OriginGuard;

/// Shared state handed to every handler (spec §4.G).
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ExecutionPipeline>,
    pub index: Arc<FileIndex>,
    pub object_store: Arc<ObjectStore>,
    pub origin_guard: Arc<OriginGuard>,
    pub schema: Option<Arc<Value>>,
    pub file_size_limit_bytes: u64,
    pub require_chat_id: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/execute", post(execute))
        .route("/v1/upload", post(upload))
        .route("/v1/download", post(download))
        .route("/v1/expire", post(expire))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok())
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// `POST /v1/execute`: tolerant normalisation, origin guard, then the
/// execution pipeline.
async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let request_id = request_id();
    let span = tracing::info_span!("execute", request_id = %request_id);
    let _guard = span.enter();

    if !state.origin_guard.allows(host_header(&headers), addr.ip()) {
        return Err(ApiError::Unauthorised);
    }

    let raw = std::str::from_utf8(&body).map_err(|e| CanonError::Unparseable(e.to_string()))?;
    let value = json_canon::parse_tolerant(raw)?;
    let value = json_canon::unwrap_envelope(value);
    let value = json_canon::canonicalise(value);
    json_canon::validate_schema(&value, state.schema.as_deref())?;

    let request: ExecutionRequest =
        serde_json::from_value(value).map_err(|e| ApiError::BadRequest(format!("malformed execute request: {e}")))?;

    validate_execution_request(&request, state.require_chat_id)?;

    let result = state.pipeline.execute(request).await?;
    Ok(Json(result).into_response())
}

fn validate_execution_request(request: &ExecutionRequest, require_chat_id: bool) -> Result<(), ApiError> {
    match &request.chat_id {
        Some(chat_id) => validation::validate_chat_id(chat_id)?,
        None if require_chat_id => return Err(ApiError::Unauthorised),
        None => {}
    }

    for (abs_path, hash) in &request.files {
        validation::validate_absolute_path(abs_path)?;
        validation::validate_hash(hash)?;
    }

    validation::parse_duration(request.expires_in.as_deref())?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    chat_id: String,
    filename: String,
    file_hash: String,
    #[serde(flatten)]
    metadata: FileMetadataView,
}

/// `POST /v1/upload`: multipart `chat_id` + `upload` file part, streamed to
/// the object store with a running byte counter enforcing
/// `file_size_limit_bytes` (spec §4.G, default 1 GiB).
async fn upload(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    if !state.origin_guard.allows(host_header(&headers), addr.ip()) {
        return Err(ApiError::Unauthorised);
    }

    let mut chat_id: Option<String> = None;
    let mut max_downloads: Option<u32> = None;
    let mut expires_in: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut file_hash: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "chat_id" => {
                chat_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                )
            }
            "max_downloads" => {
                let raw = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                max_downloads = Some(
                    raw.parse()
                        .map_err(|_| ApiError::BadRequest("max_downloads must be a non-negative integer".into()))?,
                );
            }
            "expires_in" => expires_in = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            "upload" => {
                // The object store keys uploads by chat_id, so the multipart
                // form must carry chat_id ahead of the upload part.
                let chat_id = chat_id
                    .as_deref()
                    .ok_or_else(|| ApiError::BadRequest("chat_id field must precede the upload field".into()))?;
                validation::validate_chat_id(chat_id)?;

                let this_filename = field.file_name().unwrap_or("upload").to_string();
                validation::validate_filename(&this_filename)?;

                file_hash = Some(stream_field_to_store(&state.object_store, chat_id, &this_filename, field, state.file_size_limit_bytes).await?);
                filename = Some(this_filename);
            }
            _ => {}
        }
    }

    let chat_id = chat_id.ok_or_else(|| ApiError::BadRequest("missing chat_id field".into()))?;
    let filename = filename.ok_or_else(|| ApiError::BadRequest("missing upload field".into()))?;
    let file_hash = file_hash.ok_or_else(|| ApiError::BadRequest("missing upload field".into()))?;

    let expires_in = validation::parse_duration(expires_in.as_deref())?;

    let key = FileKey::new(file_hash.clone(), chat_id.clone(), filename.clone());
    state.index.register(&key, max_downloads, expires_in).await?;
    let record = state.index.get_info(&key).await?;

    Ok((
        StatusCode::OK,
        Json(UploadResponse {
            chat_id,
            filename,
            file_hash,
            metadata: FileMetadataView::from(&record),
        }),
    )
        .into_response())
}

/// Streams a multipart field straight to the object store chunk by chunk,
/// rejecting with `413` the moment the running byte count exceeds `limit`
/// and aborting the partial write so no orphaned handle directory is left
/// behind.
async fn stream_field_to_store(
    object_store: &ObjectStore,
    chat_id: &str,
    filename: &str,
    mut field: axum::extract::multipart::Field<'_>,
    limit: u64,
) -> Result<String, ApiError> {
    let mut writer: PendingWrite = object_store.begin_put(chat_id, filename).await?;
    let mut total: u64 = 0;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                writer.abort().await;
                return Err(ApiError::BadRequest(format!("malformed upload stream: {e}")));
            }
        };

        total += chunk.len() as u64;
        if total > limit {
            writer.abort().await;
            return Err(ApiError::PayloadTooLarge);
        }

        if let Err(e) = writer.write_chunk(&chunk).await {
            writer.abort().await;
            return Err(e.into());
        }
    }

    Ok(writer.finish().await?)
}

#[derive(Debug, Deserialize)]
struct FileRef {
    chat_id: String,
    file_hash: String,
    filename: String,
}

impl FileRef {
    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_chat_id(&self.chat_id)?;
        validation::validate_hash(&self.file_hash)?;
        validation::validate_filename(&self.filename)?;
        Ok(())
    }

    fn key(&self) -> FileKey {
        FileKey::new(self.file_hash.clone(), self.chat_id.clone(), self.filename.clone())
    }
}

/// `POST /v1/download`: checks and decrements the quota, then streams the
/// blob. All index failures collapse to `404` (spec §4.G, §7 "to avoid
/// enumeration").
async fn download(State(state): State<AppState>, Json(body): Json<FileRef>) -> Result<Response, ApiError> {
    body.validate()?;
    let key = body.key();

    state.index.check_and_decrement(&key).await?;
    let file = state
        .object_store
        .read_for_pipeline(&body.chat_id, &body.file_hash, &body.filename)
        .await?;
    let body_stream = axum::body::Body::from_stream(tokio_util::io::ReaderStream::new(file));

    let content_type = guess_content_type(&body.filename);
    let disposition = format!("attachment; filename=\"{}\"", body.filename);

    Ok((
        StatusCode::OK,
        [
            (axum::http::header::CONTENT_TYPE, content_type),
            (axum::http::header::CONTENT_DISPOSITION, disposition.as_str()),
        ],
        body_stream,
    )
        .into_response())
}

/// `POST /v1/expire`: same body shape as download; tombstones the record.
async fn expire(State(state): State<AppState>, Json(body): Json<FileRef>) -> Result<Response, ApiError> {
    body.validate()?;
    state.index.expire(&body.key()).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

fn guess_content_type(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "log" | "csv" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pool_manager::PoolManager;
    use crate::infrastructure::cluster_fake::FakeClusterClient;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let object_store = Arc::new(ObjectStore::new(dir.path()).await.unwrap());
        let index = Arc::new(FileIndex::connect_in_memory().await.unwrap());
        let cluster = Arc::new(FakeClusterClient::new());
        let pool = Arc::new(PoolManager::new(cluster, 0, "runner".into(), "sandbox-".into(), None));
        let pipeline = Arc::new(ExecutionPipeline::new(pool, object_store.clone(), index.clone(), None));
        let origin_guard = Arc::new(OriginGuard::new(true, vec![], vec![], false));

        (
            AppState {
                pipeline,
                index,
                object_store,
                origin_guard,
                schema: None,
                file_size_limit_bytes: 1024 * 1024,
                require_chat_id: false,
            },
            dir,
        )
    }

    fn connect_info() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (state, _dir) = test_state().await;
        let object_store = state.object_store.clone();
        let handle = object_store
            .put("chat1", "f.txt", &mut std::io::Cursor::new(&b"payload"[..]))
            .await
            .unwrap();
        let key = FileKey::new(handle.clone(), "chat1", "f.txt");
        state.index.register(&key, Some(1), None).await.unwrap();

        let app = app(state);
        let body = json!({"chat_id": "chat1", "file_hash": handle, "filename": "f.txt"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/download")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn download_missing_file_is_not_found() {
        let (state, _dir) = test_state().await;
        let app = app(state);
        let body = json!({"chat_id": "chat1", "file_hash": "deadbeef", "filename": "f.txt"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/download")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expire_unknown_file_is_not_found() {
        let (state, _dir) = test_state().await;
        let app = app(state);
        let body = json!({"chat_id": "chat1", "file_hash": "deadbeef", "filename": "f.txt"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/expire")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn guess_content_type_defaults_to_octet_stream() {
        assert_eq!(guess_content_type("archive.bin"), "application/octet-stream");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
    }

    #[test]
    fn validate_execution_request_rejects_missing_chat_id_when_required() {
        let request = ExecutionRequest {
            source_code: "print(1)".into(),
            files: Default::default(),
            env: Default::default(),
            chat_id: None,
            max_downloads: None,
            expires_in: None,
            persistent_workspace: false,
        };
        let err = validate_execution_request(&request, true).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorised));
    }

    #[tokio::test]
    async fn execute_rejects_disallowed_origin() {
        let (mut state, _dir) = test_state().await;
        state.origin_guard = Arc::new(OriginGuard::new(false, vec![], vec![], false));
        let app = app(state);

        let body = json!({"source_code": "print(1)", "chat_id": "chat1"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/execute")
                    .header("content-type", "application/json")
                    .extension(ConnectInfo(connect_info()))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn execute_canonicalises_camelcase_keys_before_validation() {
        let (state, _dir) = test_state().await;
        let app = app(state);

        // No runner is listening at the fake container's address, so the
        // pipeline will fail downstream; the point here is that the request
        // clears normalisation and origin-guard/validation rather than
        // getting rejected as malformed.
        let body = json!({"sourceCode": "print(1)", "chatId": "chat1"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/execute")
                    .header("content-type", "application/json")
                    .extension(ConnectInfo(connect_info()))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_ne!(response.status(), StatusCode::BAD_REQUEST);
        assert_ne!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
